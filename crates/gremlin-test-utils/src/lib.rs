//! Testing utilities for the Gremlin workspace
//!
//! In-memory stand-ins for the control plane, the log store and the service
//! registry, plus topology and trace-document fixtures.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use gremlin_core::query::{value_text, Bucket, LogQuery, SearchResult};
use gremlin_core::routing::{ServiceInstance, ServiceVersions};
use gremlin_core::{
    ControlPlane, DependencyGraph, FaultRule, RecipeId, RoutingControl, ServiceRegistry,
    StoredRule, Topology, TransportError, TRACE_LOG_KEY,
};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ControlState {
    rules: Vec<StoredRule>,
    next_id: u64,
    push_failure: Option<TransportError>,
    delete_failures: HashSet<String>,
    versions: HashMap<String, ServiceVersions>,
    pushes: usize,
}

/// Control plane that keeps rules in memory and echoes generated ids
#[derive(Debug, Default)]
pub struct StubControlPlane {
    state: Mutex<ControlState>,
}

impl StubControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next push fail with `error`
    pub fn fail_next_push(&self, error: TransportError) {
        self.state.lock().push_failure = Some(error);
    }

    /// Make every delete of `id` fail
    pub fn fail_delete_of(&self, id: impl Into<String>) {
        self.state.lock().delete_failures.insert(id.into());
    }

    /// Let deletes of `id` succeed again
    pub fn heal_delete_of(&self, id: &str) {
        self.state.lock().delete_failures.remove(id);
    }

    pub fn stored_rules(&self) -> Vec<StoredRule> {
        self.state.lock().rules.clone()
    }

    pub fn rules_tagged(&self, tag: &str) -> Vec<StoredRule> {
        self.state
            .lock()
            .rules
            .iter()
            .filter(|r| r.rule.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    pub fn push_count(&self) -> usize {
        self.state.lock().pushes
    }

    pub fn seed_versions(&self, service: &str, versions: ServiceVersions) {
        self.state.lock().versions.insert(service.to_string(), versions);
    }

    pub fn versions_of(&self, service: &str) -> Option<ServiceVersions> {
        self.state.lock().versions.get(service).cloned()
    }
}

impl ControlPlane for StubControlPlane {
    fn push_rules(&self, rules: &[FaultRule]) -> Result<Vec<String>, TransportError> {
        let mut state = self.state.lock();
        state.pushes += 1;
        if let Some(error) = state.push_failure.take() {
            return Err(error);
        }
        let mut ids = Vec::with_capacity(rules.len());
        for rule in rules {
            state.next_id += 1;
            let id = format!("rule-{}", state.next_id);
            state.rules.push(StoredRule {
                id: id.clone(),
                rule: rule.clone(),
            });
            ids.push(id);
        }
        Ok(ids)
    }

    fn delete_rule(&self, id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.delete_failures.contains(id) {
            return Err(TransportError::UnexpectedStatus {
                endpoint: "stub://rules".to_string(),
                status: 500,
                body: format!("cannot delete {id}"),
            });
        }
        let before = state.rules.len();
        state.rules.retain(|r| r.id != id);
        if state.rules.len() == before {
            return Err(TransportError::UnexpectedStatus {
                endpoint: "stub://rules".to_string(),
                status: 404,
                body: format!("no rule {id}"),
            });
        }
        Ok(())
    }

    fn delete_rules_by_tag(&self, tag: &str) -> Result<(), TransportError> {
        self.state
            .lock()
            .rules
            .retain(|r| !r.rule.tags.iter().any(|t| t == tag));
        Ok(())
    }

    fn list_rules(&self) -> Result<Vec<StoredRule>, TransportError> {
        Ok(self.stored_rules())
    }

    fn clear_rules(&self) -> Result<(), TransportError> {
        self.state.lock().rules.clear();
        Ok(())
    }
}

impl RoutingControl for StubControlPlane {
    fn get_versions(&self, service: &str) -> Result<Option<ServiceVersions>, TransportError> {
        Ok(self.versions_of(service))
    }

    fn set_versions(&self, service: &str, versions: &ServiceVersions) -> Result<(), TransportError> {
        self.seed_versions(service, versions.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log store
// ---------------------------------------------------------------------------

/// Log store evaluating [`LogQuery`] over documents held in memory
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    docs: Mutex<Vec<Value>>,
    queries: Mutex<Vec<LogQuery>>,
    failure: Mutex<Option<TransportError>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_docs(docs: impl IntoIterator<Item = Value>) -> Self {
        let store = Self::new();
        store.docs.lock().extend(docs);
        store
    }

    pub fn push(&self, doc: Value) {
        self.docs.lock().push(doc);
    }

    /// Make every search fail with `error`
    pub fn fail_with(&self, error: TransportError) {
        *self.failure.lock() = Some(error);
    }

    /// Queries received so far
    pub fn queries(&self) -> Vec<LogQuery> {
        self.queries.lock().clone()
    }

    fn matches(doc: &Value, query: &LogQuery, pattern: Option<&Regex>) -> bool {
        let field = |name: &str| doc.get(name).and_then(value_text);

        let exact = query
            .must_match
            .iter()
            .all(|m| field(&m.field).as_deref() == Some(m.value.as_str()));
        let regexp = match (&query.pattern, pattern) {
            (Some(p), Some(re)) => field(&p.field).is_some_and(|v| re.is_match(&v)),
            _ => true,
        };
        let timed = query.time_range.as_ref().map_or(true, |range| {
            field(&range.field)
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .is_some_and(|t| range.window.contains(t.with_timezone(&Utc)))
        });
        exact && regexp && timed
    }
}

impl gremlin_core::LogStore for InMemoryLogStore {
    fn search(&self, query: &LogQuery) -> Result<SearchResult, TransportError> {
        self.queries.lock().push(query.clone());
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        let pattern = match &query.pattern {
            Some(p) => Some(Regex::new(&format!("^(?:{})$", p.pattern)).map_err(|e| {
                TransportError::UnexpectedStatus {
                    endpoint: "memory".to_string(),
                    status: 400,
                    body: e.to_string(),
                }
            })?),
            None => None,
        };

        let docs = self.docs.lock();
        let matched: Vec<&Value> = docs
            .iter()
            .filter(|d| Self::matches(d, query, pattern.as_ref()))
            .collect();

        let buckets = query
            .group_by
            .as_ref()
            .map(|field| {
                let mut counts: BTreeMap<String, u64> = BTreeMap::new();
                for doc in &matched {
                    if let Some(key) = doc.get(field).and_then(value_text) {
                        *counts.entry(key).or_insert(0) += 1;
                    }
                }
                let mut buckets: Vec<Bucket> = counts
                    .into_iter()
                    .map(|(key, doc_count)| Bucket { key, doc_count })
                    .collect();
                buckets.sort_by(|a, b| b.doc_count.cmp(&a.doc_count).then_with(|| a.key.cmp(&b.key)));
                buckets
            })
            .unwrap_or_default();

        Ok(SearchResult {
            total: matched.len() as u64,
            hits: matched.into_iter().take(query.size).cloned().collect(),
            buckets,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry with a fixed instance list per service
#[derive(Debug, Default)]
pub struct StubRegistry {
    services: Mutex<BTreeMap<String, Vec<ServiceInstance>>>,
}

impl StubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one instance of `service` running `version` (`None` = unversioned)
    pub fn with_instance(self, service: &str, version: Option<&str>) -> Self {
        let instance = version.map_or_else(ServiceInstance::default, ServiceInstance::versioned);
        self.services
            .lock()
            .entry(service.to_string())
            .or_default()
            .push(instance);
        self
    }
}

impl ServiceRegistry for StubRegistry {
    fn list_services(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.services.lock().keys().cloned().collect())
    }

    fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>, TransportError> {
        self.services
            .lock()
            .get(service)
            .cloned()
            .ok_or_else(|| TransportError::UnexpectedStatus {
                endpoint: format!("stub://services/{service}"),
                status: 404,
                body: "unknown service".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// The bookinfo sample application
///
/// gateway → productpage → {reviews:v2, details}, reviews → ratings
pub fn bookinfo_topology() -> Topology {
    Topology::from_value(bookinfo_json()).expect("bookinfo topology is valid")
}

pub fn bookinfo_json() -> Value {
    json!({
        "services": ["gateway", "productpage", {"name": "reviews", "tags": ["v2"]}, "details", "ratings"],
        "dependencies": {
            "gateway": ["productpage"],
            "productpage": ["reviews", "details"],
            "reviews": ["ratings"]
        }
    })
}

pub fn bookinfo_graph() -> DependencyGraph {
    DependencyGraph::from_topology(&bookinfo_topology()).expect("bookinfo graph is valid")
}

/// Builder for a request-trace document in the default field layout
#[derive(Debug, Clone)]
pub struct TraceDoc {
    fields: Map<String, Value>,
}

/// Trace document for `src -> dst` carrying `recipe`
pub fn trace(recipe: RecipeId, src: &str, dst: &str) -> TraceDoc {
    let mut fields = Map::new();
    fields.insert(TRACE_LOG_KEY.to_string(), json!(recipe.to_string()));
    fields.insert("src".to_string(), json!(src));
    fields.insert("dst".to_string(), json!(dst));
    fields.insert("status".to_string(), json!(200));
    TraceDoc { fields }
}

impl TraceDoc {
    pub fn status(self, status: u16) -> Self {
        self.field("status", json!(status))
    }

    /// Upstream response time in seconds
    pub fn latency(self, seconds: f64) -> Self {
        self.field("upstream_response_time", json!(seconds))
    }

    pub fn timestamp_ms(self, ms: u64) -> Self {
        self.field("timestamp_in_ms", json!(ms))
    }

    pub fn at(self, time: DateTime<Utc>) -> Self {
        self.field("@timestamp", json!(time.to_rfc3339()))
    }

    pub fn request_id(self, id: &str) -> Self {
        self.field("request_id", json!(id))
    }

    pub fn uri(self, uri: &str) -> Self {
        self.field("uri", json!(uri))
    }

    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}
