//! Assertion checker
//!
//! Every query is scoped to one run: by the recipe id that trace actions
//! write into request logs, by a header regex, or both, optionally narrowed
//! to a time window. An empty result is a failed assertion, never a vacuous
//! pass, and the checker does not retry empty queries.

use crate::assertion::{
    Assertion, AssertionResult, Check, Checklist, RequestCountCheck, ResponseTimeCheck, RetryCheck,
    StatusCheck,
};
use crate::error::{TransportError, ValidationError};
use crate::query::{value_f64, value_text, LogFields, LogQuery, SearchResult, TimeWindow};
use crate::transport::LogStore;
use crate::types::RecipeId;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::Arc;

/// Requests per group tolerated on top of the asserted count
///
/// Group counts include one request beyond those the assertion is about, so
/// a limit of N accepts N + 1 documents and failures report `doc_count - 1`.
pub const BASELINE_REQUEST_ALLOWANCE: u64 = 1;

/// Message of a predicate that found no documents
pub const NO_ENTRIES: &str = "No log entries found";

const SPACING_EPSILON: f64 = 1e-9;

/// Pass/fail of one predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the predicate held
    pub success: bool,
    /// Why it failed; empty on success
    pub message: String,
}

impl Verdict {
    /// Passing verdict
    #[must_use]
    pub fn pass() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    /// Failing verdict
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Header-regex scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderScope {
    /// Log field holding the header value
    pub field: String,
    /// Regex the value must match
    pub pattern: String,
}

/// Builder for [`AssertionChecker`]
pub struct AssertionCheckerBuilder {
    store: Arc<dyn LogStore>,
    fields: LogFields,
    recipe: Option<RecipeId>,
    header: Option<HeaderScope>,
    window: TimeWindow,
}

impl AssertionCheckerBuilder {
    /// Scope queries to documents traced with this recipe id
    #[must_use]
    pub fn recipe(mut self, id: RecipeId) -> Self {
        self.recipe = Some(id);
        self
    }

    /// Scope queries to documents whose `field` matches `pattern`
    #[must_use]
    pub fn header(mut self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.header = Some(HeaderScope {
            field: field.into(),
            pattern: pattern.into(),
        });
        self
    }

    /// Only consider documents inside `[start, end]`
    #[must_use]
    pub fn window(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.window = TimeWindow { start, end };
        self
    }

    /// Override log document field names
    #[must_use]
    pub fn fields(mut self, fields: LogFields) -> Self {
        self.fields = fields;
        self
    }

    /// Finish the checker
    ///
    /// # Errors
    /// [`ValidationError::MissingScopeIdentity`] when neither a recipe id nor
    /// a header scope was given.
    pub fn build(self) -> Result<AssertionChecker, ValidationError> {
        if self.recipe.is_none() && self.header.is_none() {
            return Err(ValidationError::MissingScopeIdentity);
        }
        Ok(AssertionChecker {
            store: self.store,
            fields: self.fields,
            recipe: self.recipe,
            header: self.header,
            window: self.window,
        })
    }
}

/// Evaluates checklists against one run's request logs
pub struct AssertionChecker {
    store: Arc<dyn LogStore>,
    fields: LogFields,
    recipe: Option<RecipeId>,
    header: Option<HeaderScope>,
    window: TimeWindow,
}

impl AssertionChecker {
    /// Start building a checker over `store`
    #[must_use]
    pub fn builder(store: Arc<dyn LogStore>) -> AssertionCheckerBuilder {
        AssertionCheckerBuilder {
            store,
            fields: LogFields::default(),
            recipe: None,
            header: None,
            window: TimeWindow::default(),
        }
    }

    /// Recipe the checker is scoped to, if any
    #[must_use]
    pub fn recipe(&self) -> Option<RecipeId> {
        self.recipe
    }

    /// Evaluate a checklist in order
    ///
    /// With `continue_on_error == false` evaluation stops after the first
    /// failing assertion, which is included in the result.
    ///
    /// # Errors
    /// The first log-store failure; results gathered so far are dropped.
    pub fn check_assertions(
        &self,
        checklist: &Checklist,
        continue_on_error: bool,
    ) -> Result<Vec<AssertionResult>, TransportError> {
        let mut results = Vec::with_capacity(checklist.checks.len());
        for assertion in &checklist.checks {
            let result = self.check_assertion(assertion)?;
            let failed = !result.success;
            results.push(result);
            if failed && !continue_on_error {
                tracing::info!(evaluated = results.len(), "stopping at first failed assertion");
                break;
            }
        }
        let passed = results.iter().filter(|r| r.success).count();
        tracing::info!(passed, total = results.len(), "checklist evaluated");
        Ok(results)
    }

    /// Evaluate one assertion
    ///
    /// # Errors
    /// Returns an error if the log store cannot be queried.
    pub fn check_assertion(&self, assertion: &Assertion) -> Result<AssertionResult, TransportError> {
        let verdict = match assertion.check() {
            Check::BoundedResponseTime(c) => self.bounded_response_time(c)?,
            Check::HttpStatus(c) => self.http_status(c)?,
            Check::AtMostRequests(c) => self.at_most_requests(c)?,
            Check::BoundedRetries(c) => self.bounded_retries(c)?,
        };
        if verdict.success {
            tracing::debug!(assertion = %assertion.kind(), "assertion passed");
        } else {
            tracing::debug!(assertion = %assertion.kind(), reason = %verdict.message, "assertion failed");
        }
        Ok(AssertionResult::new(assertion, verdict.success, verdict.message))
    }

    /// Every call answered within `max_latency`
    ///
    /// # Errors
    /// Returns an error if the log store cannot be queried.
    pub fn bounded_response_time(&self, check: &ResponseTimeCheck) -> Result<Verdict, TransportError> {
        let result = self.search(self.scoped_query(&check.source, &check.dest))?;
        if result.is_empty() {
            return Ok(Verdict::fail(NO_ENTRIES));
        }

        let max = check.max_latency.as_secs_f64();
        let mut first_offender: Option<String> = None;
        for doc in &result.hits {
            let observed = doc.get(&self.fields.response_time).and_then(value_f64);
            let exceeded = observed.map_or(true, |t| t > max);
            if !exceeded {
                continue;
            }
            let shown = observed.map_or_else(|| "unknown".to_string(), |t| t.to_string());
            tracing::debug!(
                source = %check.source,
                dest = %check.dest,
                observed = %shown,
                max,
                "response time exceeded"
            );
            first_offender.get_or_insert_with(|| {
                format!(
                    "{} did not reply in time for request from {}: found one instance where resp time was {shown}s - max {max}s",
                    check.dest, check.source
                )
            });
        }
        Ok(first_offender.map_or_else(Verdict::pass, Verdict::fail))
    }

    /// Every call answered with a status in `status`
    ///
    /// # Errors
    /// Returns an error if the log store cannot be queried.
    pub fn http_status(&self, check: &StatusCheck) -> Result<Verdict, TransportError> {
        let result = self.search(self.scoped_query(&check.source, &check.dest))?;
        if result.is_empty() {
            return Ok(Verdict::fail(NO_ENTRIES));
        }

        for doc in &result.hits {
            let raw = doc.get(&self.fields.status);
            let status = raw.and_then(value_f64).and_then(|s| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let code = s as u16;
                (f64::from(code) == s).then_some(code)
            });
            match status {
                Some(code) if check.status.contains(code) => {}
                Some(499) => {
                    return Ok(Verdict::fail(format!(
                        "{} -> {} - unexpected connection termination",
                        check.source, check.dest
                    )));
                }
                _ => {
                    let shown = raw.and_then(value_text).unwrap_or_else(|| "missing".to_string());
                    return Ok(Verdict::fail(format!(
                        "{} -> {} - unexpected status {shown}",
                        check.source, check.dest
                    )));
                }
            }
        }
        Ok(Verdict::pass())
    }

    /// No trace group holds more than `num_requests` requests
    ///
    /// # Errors
    /// Returns an error if the log store cannot be queried.
    pub fn at_most_requests(&self, check: &RequestCountCheck) -> Result<Verdict, TransportError> {
        let query = self
            .scoped_query(&check.source, &check.dest)
            .grouped_by(self.fields.trace_key.clone());
        let result = self.search(query)?;
        if result.is_empty() {
            return Ok(Verdict::fail(NO_ENTRIES));
        }

        let limit = check.num_requests + BASELINE_REQUEST_ALLOWANCE;
        if let Some(bucket) = result.buckets.iter().find(|b| b.doc_count > limit) {
            return Ok(Verdict::fail(format!(
                "{} -> {} - expected {} requests, but found {} requests for id {}",
                check.source,
                check.dest,
                check.num_requests,
                bucket.doc_count - BASELINE_REQUEST_ALLOWANCE,
                bucket.key
            )));
        }
        Ok(Verdict::pass())
    }

    /// No request retried more than `retries` times, spaced by `wait_time`
    ///
    /// # Errors
    /// Returns an error if the log store cannot be queried.
    pub fn bounded_retries(&self, check: &RetryCheck) -> Result<Verdict, TransportError> {
        let group_field = if check.by_uri {
            &self.fields.uri
        } else {
            &self.fields.request_id
        };
        let query = self
            .scoped_query(&check.source, &check.dest)
            .grouped_by(group_field.clone());
        let result = self.search(query)?;
        if result.is_empty() {
            return Ok(Verdict::fail(NO_ENTRIES));
        }

        let limit = check.retries + BASELINE_REQUEST_ALLOWANCE;
        if let Some(bucket) = result.buckets.iter().find(|b| b.doc_count > limit) {
            return Ok(Verdict::fail(format!(
                "{} -> {} - expected {} retries, but found {} retries for request {}",
                check.source,
                check.dest,
                check.retries,
                bucket.doc_count - BASELINE_REQUEST_ALLOWANCE,
                bucket.key
            )));
        }

        let Some(wait_time) = check.wait_time else {
            return Ok(Verdict::pass());
        };
        let wait = wait_time.as_secs_f64();
        let delta = check.errdelta.unwrap_or(0.0);

        for (key, mut stamps) in self.attempt_times(&result, group_field) {
            stamps.sort_by(f64::total_cmp);
            for (attempt, pair) in stamps.windows(2).enumerate() {
                let observed = (pair[1] - pair[0]) / 1000.0;
                if observed < wait - delta - SPACING_EPSILON || observed > wait + delta + SPACING_EPSILON {
                    return Ok(Verdict::fail(format!(
                        "{} -> {} - expected {wait}+/-{delta}s spacing for retry attempt {}, but request {key} had a spacing of {observed}s",
                        check.source,
                        check.dest,
                        attempt + 1
                    )));
                }
            }
        }
        Ok(Verdict::pass())
    }

    /// Attempt timestamps (ms) grouped by `field`, in first-seen order
    fn attempt_times(&self, result: &SearchResult, field: &str) -> IndexMap<String, Vec<f64>> {
        let mut groups: IndexMap<String, Vec<f64>> = IndexMap::new();
        for doc in &result.hits {
            let Some(key) = doc.get(field).and_then(value_text) else {
                continue;
            };
            match doc.get(&self.fields.timestamp_ms).and_then(value_f64) {
                Some(ms) => groups.entry(key).or_default().push(ms),
                None => tracing::debug!(group = %key, "document without timestamp skipped"),
            }
        }
        groups
    }

    fn scoped_query(&self, source: &str, dest: &str) -> LogQuery {
        let mut query = LogQuery::new();
        if let Some(recipe) = self.recipe {
            query = query.matching(self.fields.trace_key.clone(), recipe.to_string());
        }
        query = query
            .matching(self.fields.source.clone(), source)
            .matching(self.fields.dest.clone(), dest);
        if let Some(header) = &self.header {
            query = query.with_pattern(header.field.clone(), header.pattern.clone());
        }
        query.within(self.fields.timestamp.clone(), self.window)
    }

    fn search(&self, query: LogQuery) -> Result<SearchResult, TransportError> {
        let result = self.store.search(&query)?;
        tracing::debug!(total = result.total, groups = result.buckets.len(), "log query answered");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Bucket;
    use crate::transport::MockLogStore;
    use serde_json::{json, Value};

    fn checker_with(result: SearchResult) -> AssertionChecker {
        let mut store = MockLogStore::new();
        store.expect_search().returning(move |_| Ok(result.clone()));
        AssertionChecker::builder(Arc::new(store))
            .recipe(RecipeId::new())
            .build()
            .unwrap()
    }

    fn docs(hits: Vec<Value>) -> SearchResult {
        SearchResult {
            total: hits.len() as u64,
            hits,
            buckets: Vec::new(),
        }
    }

    #[test]
    fn requires_scope_identity() {
        let store = Arc::new(MockLogStore::new());
        assert!(matches!(
            AssertionChecker::builder(store.clone()).build(),
            Err(ValidationError::MissingScopeIdentity)
        ));
        assert!(AssertionChecker::builder(store)
            .header("x-request-id", ".*?test")
            .build()
            .is_ok());
    }

    #[test]
    fn scoped_query_carries_every_scope_clause() {
        let recipe = RecipeId::new();
        let mut store = MockLogStore::new();
        store
            .expect_search()
            .withf(move |q| {
                let body = q.to_search_body();
                let must = body["query"]["bool"]["must"].as_array().cloned().unwrap_or_default();
                must.contains(&json!({"match": {"gremlin_recipe_id": recipe.to_string()}}))
                    && must.contains(&json!({"match": {"src": "a"}}))
                    && must.contains(&json!({"match": {"dst": "b"}}))
                    && must.contains(&json!({"regexp": {"x-gremlin": ".*?t1"}}))
                    && body["query"]["bool"]["filter"].is_array()
            })
            .times(1)
            .returning(|_| Ok(SearchResult::default()));
        let checker = AssertionChecker::builder(Arc::new(store))
            .recipe(recipe)
            .header("x-gremlin", ".*?t1")
            .window(Some(Utc::now()), None)
            .build()
            .unwrap();
        let verdict = checker
            .bounded_response_time(&ResponseTimeCheck {
                source: "a".into(),
                dest: "b".into(),
                max_latency: "1s".parse().unwrap(),
            })
            .unwrap();
        assert_eq!(verdict, Verdict::fail(NO_ENTRIES));
    }

    #[test]
    fn missing_status_is_reported() {
        let checker = checker_with(docs(vec![json!({"src": "a", "dst": "b"})]));
        let verdict = checker
            .http_status(&StatusCheck {
                source: "a".into(),
                dest: "b".into(),
                status: [200].into(),
            })
            .unwrap();
        assert_eq!(verdict.message, "a -> b - unexpected status missing");
    }

    #[test]
    fn string_statuses_are_accepted() {
        let checker = checker_with(docs(vec![json!({"status": "200"}), json!({"status": 200})]));
        let verdict = checker
            .http_status(&StatusCheck {
                source: "a".into(),
                dest: "b".into(),
                status: [200].into(),
            })
            .unwrap();
        assert!(verdict.success);
    }

    #[test]
    fn retries_counted_per_group() {
        let mut result = docs(vec![json!({"request_id": "r1"})]);
        result.buckets = vec![Bucket { key: "r1".into(), doc_count: 5 }];
        let checker = checker_with(result);
        let verdict = checker
            .bounded_retries(&RetryCheck {
                source: "a".into(),
                dest: "b".into(),
                retries: 3,
                wait_time: None,
                errdelta: None,
                by_uri: false,
            })
            .unwrap();
        assert_eq!(
            verdict.message,
            "a -> b - expected 3 retries, but found 4 retries for request r1"
        );
    }

    #[test]
    fn transport_failures_propagate() {
        let mut store = MockLogStore::new();
        store
            .expect_search()
            .returning(|_| Err(TransportError::unreachable("es", "refused")));
        let checker = AssertionChecker::builder(Arc::new(store))
            .recipe(RecipeId::new())
            .build()
            .unwrap();
        let err = checker
            .at_most_requests(&RequestCountCheck {
                source: "a".into(),
                dest: "b".into(),
                num_requests: 1,
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }
}
