//! Log-store queries and results
//!
//! [`LogQuery`] is a store-neutral description of a search: exact field
//! matches, an optional anchored regex on one field, an optional time range
//! and an optional terms grouping. [`LogQuery::to_search_body`] renders it as
//! an Elasticsearch bool query.

use crate::error::TransportError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Largest number of documents a single query returns
pub const MAX_QUERY_RESULTS: usize = 500;

/// Name of the terms aggregation in search bodies
pub const GROUP_AGGREGATION: &str = "byid";

/// Field names of trace documents in the log store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFields {
    /// Calling service
    pub source: String,
    /// Called service
    pub dest: String,
    /// HTTP status
    pub status: String,
    /// Upstream latency in seconds
    pub response_time: String,
    /// Epoch milliseconds of the request
    pub timestamp_ms: String,
    /// Document time, used for windows
    pub timestamp: String,
    /// Recipe id written by trace actions
    pub trace_key: String,
    /// Per-request id, used to group retries
    pub request_id: String,
    /// Request URI, used to group retries when `by_uri` is set
    pub uri: String,
}

impl Default for LogFields {
    fn default() -> Self {
        Self {
            source: "src".to_string(),
            dest: "dst".to_string(),
            status: "status".to_string(),
            response_time: "upstream_response_time".to_string(),
            timestamp_ms: "timestamp_in_ms".to_string(),
            timestamp: "@timestamp".to_string(),
            trace_key: crate::rules::TRACE_LOG_KEY.to_string(),
            request_id: "request_id".to_string(),
            uri: "uri".to_string(),
        }
    }
}

/// Inclusive time window; either end may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Earliest document time
    pub start: Option<DateTime<Utc>>,
    /// Latest document time
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Whether `at` falls inside the window
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }

    /// Whether both ends are open
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// `field == value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    /// Document field
    pub field: String,
    /// Expected value
    pub value: String,
}

/// `field` matches `pattern` as a whole-value regex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPattern {
    /// Document field
    pub field: String,
    /// Regex, anchored at both ends
    pub pattern: String,
}

/// Time filter on one document field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    /// Document field holding an RFC 3339 timestamp
    pub field: String,
    /// Accepted window
    pub window: TimeWindow,
}

/// Store-neutral search request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// All of these must hold
    pub must_match: Vec<FieldMatch>,
    /// Optional regex filter
    pub pattern: Option<FieldPattern>,
    /// Optional time filter
    pub time_range: Option<TimeRange>,
    /// Field to count documents by
    pub group_by: Option<String>,
    /// Maximum number of documents returned
    pub size: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            must_match: Vec::new(),
            pattern: None,
            time_range: None,
            group_by: None,
            size: MAX_QUERY_RESULTS,
        }
    }
}

impl LogQuery {
    /// Empty query returning up to [`MAX_QUERY_RESULTS`] documents
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exact-match clause
    #[must_use]
    pub fn matching(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.must_match.push(FieldMatch {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Require `field` to match `pattern`
    #[must_use]
    pub fn with_pattern(mut self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.pattern = Some(FieldPattern {
            field: field.into(),
            pattern: pattern.into(),
        });
        self
    }

    /// Restrict to a time window; unbounded windows are dropped
    #[must_use]
    pub fn within(mut self, field: impl Into<String>, window: TimeWindow) -> Self {
        self.time_range = (!window.is_unbounded()).then(|| TimeRange {
            field: field.into(),
            window,
        });
        self
    }

    /// Count documents by `field`
    #[must_use]
    pub fn grouped_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }

    /// Elasticsearch `_search` body for this query
    #[must_use]
    pub fn to_search_body(&self) -> Value {
        let must: Vec<Value> = self
            .must_match
            .iter()
            .map(|m| json!({"match": {m.field.as_str(): m.value}}))
            .chain(
                self.pattern
                    .iter()
                    .map(|p| json!({"regexp": {p.field.as_str(): p.pattern}})),
            )
            .collect();

        let mut bool_query = Map::new();
        bool_query.insert("must".to_string(), Value::Array(must));
        if let Some(range) = &self.time_range {
            let mut bounds = Map::new();
            if let Some(start) = range.window.start {
                bounds.insert("gte".to_string(), Value::String(start.to_rfc3339()));
            }
            if let Some(end) = range.window.end {
                bounds.insert("lte".to_string(), Value::String(end.to_rfc3339()));
            }
            bool_query.insert(
                "filter".to_string(),
                json!([{"range": {range.field.as_str(): bounds}}]),
            );
        }

        let mut body = json!({
            "size": self.size,
            "query": {"bool": bool_query},
        });
        if let Some(field) = &self.group_by {
            body["aggs"] = json!({
                GROUP_AGGREGATION: {"terms": {"field": field, "size": self.size}}
            });
        }
        body
    }
}

/// One terms-aggregation bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Grouping value
    pub key: String,
    /// Number of documents with that value
    pub doc_count: u64,
}

/// Documents and groups returned by a search
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    /// Total number of matching documents, possibly more than `hits`
    pub total: u64,
    /// Matching documents (`_source` bodies)
    pub hits: Vec<Value>,
    /// Groups, when the query asked for them
    pub buckets: Vec<Bucket>,
}

impl SearchResult {
    /// Whether nothing matched
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0 || self.hits.is_empty()
    }

    /// Decode an Elasticsearch `_search` response
    ///
    /// `hits.total` may be a plain number or `{"value": n}`. Bucket keys are
    /// stringified.
    ///
    /// # Errors
    /// [`TransportError::MalformedResponse`] if the `hits` section is missing.
    pub fn from_es_response(endpoint: &str, response: &Value) -> Result<Self, TransportError> {
        let hits = response
            .get("hits")
            .ok_or_else(|| TransportError::malformed(endpoint, "response has no 'hits'"))?;

        let total = match hits.get("total") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::Object(o)) => o.get("value").and_then(Value::as_u64).unwrap_or(0),
            _ => 0,
        };

        let docs = hits
            .get("hits")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|h| h.get("_source").cloned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let buckets = response
            .pointer(&format!("/aggregations/{GROUP_AGGREGATION}/buckets"))
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|b| {
                        Some(Bucket {
                            key: value_text(b.get("key")?)?,
                            doc_count: b.get("doc_count")?.as_u64()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            total,
            hits: docs,
            buckets,
        })
    }
}

/// Text form of a scalar document value; `None` for objects, arrays and null
#[must_use]
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numeric form of a document value; numeric strings are accepted
#[must_use]
pub fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_match_clauses_and_size() {
        let body = LogQuery::new()
            .matching("gremlin_recipe_id", "r1")
            .matching("src", "a")
            .matching("dst", "b")
            .to_search_body();
        assert_eq!(
            body,
            json!({
                "size": 500,
                "query": {"bool": {"must": [
                    {"match": {"gremlin_recipe_id": "r1"}},
                    {"match": {"src": "a"}},
                    {"match": {"dst": "b"}}
                ]}}
            })
        );
    }

    #[test]
    fn renders_pattern_window_and_grouping() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let body = LogQuery::new()
            .with_pattern("x-request-id", ".*?test")
            .within(
                "@timestamp",
                TimeWindow {
                    start: Some(start),
                    end: None,
                },
            )
            .grouped_by("request_id")
            .to_search_body();
        assert_eq!(
            body["query"]["bool"]["must"],
            json!([{"regexp": {"x-request-id": ".*?test"}}])
        );
        assert_eq!(
            body["query"]["bool"]["filter"],
            json!([{"range": {"@timestamp": {"gte": "2024-01-01T00:00:00+00:00"}}}])
        );
        assert_eq!(body["aggs"]["byid"]["terms"]["field"], "request_id");
    }

    #[test]
    fn unbounded_window_adds_no_filter() {
        let body = LogQuery::new()
            .matching("a", "b")
            .within("@timestamp", TimeWindow::default())
            .to_search_body();
        assert!(body["query"]["bool"].get("filter").is_none());
    }

    #[test]
    fn decodes_search_responses() {
        let response = json!({
            "hits": {
                "total": {"value": 2, "relation": "eq"},
                "hits": [
                    {"_id": "1", "_source": {"src": "a", "status": 200}},
                    {"_id": "2", "_source": {"src": "a", "status": 503}}
                ]
            },
            "aggregations": {"byid": {"buckets": [
                {"key": "r1", "doc_count": 2},
                {"key": 7, "doc_count": 1}
            ]}}
        });
        let result = SearchResult::from_es_response("es", &response).unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.hits.len(), 2);
        assert_eq!(result.hits[1]["status"], 503);
        assert_eq!(
            result.buckets,
            vec![
                Bucket { key: "r1".into(), doc_count: 2 },
                Bucket { key: "7".into(), doc_count: 1 }
            ]
        );
    }

    #[test]
    fn accepts_legacy_numeric_total() {
        let result = SearchResult::from_es_response("es", &json!({"hits": {"total": 0, "hits": []}})).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn missing_hits_is_malformed() {
        let err = SearchResult::from_es_response("es", &json!({"error": "boom"})).unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse { .. }));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let w = TimeWindow { start: Some(start), end: Some(end) };
        assert!(w.contains(start));
        assert!(w.contains(end));
        assert!(!w.contains(end + chrono::Duration::seconds(1)));
    }

    #[test]
    fn numeric_strings_are_numbers() {
        assert_eq!(value_f64(&json!("0.120")), Some(0.12));
        assert_eq!(value_f64(&json!(3)), Some(3.0));
        assert_eq!(value_f64(&json!(null)), None);
    }
}
