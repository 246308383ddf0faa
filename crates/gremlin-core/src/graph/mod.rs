//! Service dependency graph with per-edge coverage flags
//!
//! Nodes are keyed by service name; the version tags of a node are metadata
//! carried into generated rules. Edges are kept in declaration order, which
//! is also the order every edge query returns them in.

use crate::error::ValidationError;
use crate::topology::Topology;
use crate::types::ServiceRef;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct EdgeMeta {
    /// Callee reference exactly as declared, used to detect conflicting duplicates
    declared: ServiceRef,
}

/// Directed call graph between services
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    inner: DiGraph<ServiceRef, EdgeMeta>,
    by_name: HashMap<String, NodeIndex>,
    /// Coverage flag per edge, indexed by `EdgeIndex::index()`
    covered: Vec<bool>,
}

impl DependencyGraph {
    /// Empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from a topology document
    ///
    /// # Errors
    /// [`ValidationError::MalformedTopology`] on nameless services or duplicate
    /// edges with conflicting tags.
    pub fn from_topology(topology: &Topology) -> Result<Self, ValidationError> {
        let mut graph = Self::new();
        for decl in &topology.services {
            let service = parse_ref(&decl.reference())?;
            graph.add_service(service)?;
        }
        for (caller, callees) in &topology.dependencies {
            let caller = parse_ref(caller)?;
            for callee in callees {
                let callee = parse_ref(callee)?;
                graph.add_dependency(&caller, &callee)?;
            }
        }
        tracing::debug!(
            services = graph.service_count(),
            edges = graph.edge_count(),
            "dependency graph built"
        );
        Ok(graph)
    }

    /// Add a service node, or merge its version tags into the existing node
    ///
    /// Several versions of one service collapse into a single node carrying
    /// the union of their tags, in first-seen order.
    ///
    /// # Errors
    /// [`ValidationError::MalformedTopology`] if the service has no name.
    pub fn add_service(&mut self, service: ServiceRef) -> Result<NodeIndex, ValidationError> {
        if service.name().is_empty() {
            return Err(ValidationError::MalformedTopology(
                "service with no name".to_string(),
            ));
        }
        if let Some(&idx) = self.by_name.get(service.name()) {
            let node = &mut self.inner[idx];
            if service.is_tagged() && node.version_tags() != service.version_tags() {
                node.merge_tags(&service);
                tracing::debug!(service = %node, "version tags merged");
            }
            return Ok(idx);
        }
        let name = service.name().to_string();
        let idx = self.inner.add_node(service);
        self.by_name.insert(name, idx);
        Ok(idx)
    }

    /// Add a call edge, adding either endpoint implicitly
    ///
    /// Self-loops are allowed. Declaring the same edge twice with the same
    /// references is a no-op.
    ///
    /// # Errors
    /// [`ValidationError::MalformedTopology`] if the edge exists with a
    /// different callee reference, or an endpoint has no name.
    pub fn add_dependency(
        &mut self,
        caller: &ServiceRef,
        callee: &ServiceRef,
    ) -> Result<(), ValidationError> {
        let from = self.add_service(caller.clone())?;
        let to = self.add_service(callee.clone())?;

        if let Some(existing) = self.inner.find_edge(from, to) {
            let declared = &self.inner[existing].declared;
            if declared != callee {
                return Err(ValidationError::MalformedTopology(format!(
                    "dependency {} -> {} declared as both '{declared}' and '{callee}'",
                    caller.name(),
                    callee.name()
                )));
            }
            tracing::debug!(caller = %caller, callee = %callee, "duplicate dependency ignored");
            return Ok(());
        }

        self.inner.add_edge(
            from,
            to,
            EdgeMeta {
                declared: callee.clone(),
            },
        );
        self.covered.push(false);
        Ok(())
    }

    /// All declared service names
    #[must_use]
    pub fn services(&self) -> BTreeSet<String> {
        self.by_name.keys().cloned().collect()
    }

    /// Node reference for a service name, tags included
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceRef> {
        self.by_name.get(name).map(|&idx| &self.inner[idx])
    }

    /// Whether the service is declared
    #[inline]
    #[must_use]
    pub fn contains_service(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Direct callees of `service`, in edge declaration order
    #[must_use]
    pub fn dependencies(&self, service: &str) -> Vec<&ServiceRef> {
        let Some(&idx) = self.by_name.get(service) else {
            return Vec::new();
        };
        self.inner
            .edge_references()
            .filter(|e| e.source() == idx)
            .map(|e| &self.inner[e.target()])
            .collect()
    }

    /// Direct callers of `service`, in edge declaration order
    #[must_use]
    pub fn dependents(&self, service: &str) -> Vec<&ServiceRef> {
        let Some(&idx) = self.by_name.get(service) else {
            return Vec::new();
        };
        self.inner
            .edge_references()
            .filter(|e| e.target() == idx)
            .map(|e| &self.inner[e.source()])
            .collect()
    }

    /// Whether `source` calls `dest` directly
    #[must_use]
    pub fn has_edge(&self, source: &str, dest: &str) -> bool {
        self.edge_index(source, dest).is_some()
    }

    /// Number of services
    #[inline]
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.inner.node_count()
    }

    /// Number of call edges
    #[inline]
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// All edges as (caller, callee) node references, in declaration order
    #[must_use]
    pub fn edges(&self) -> Vec<(&ServiceRef, &ServiceRef)> {
        self.inner
            .edge_references()
            .map(|e| (&self.inner[e.source()], &self.inner[e.target()]))
            .collect()
    }

    /// Flag an edge as covered; unknown edges are ignored
    pub fn mark_covered(&mut self, source: &str, dest: &str) {
        match self.edge_index(source, dest) {
            Some(edge) => self.covered[edge.index()] = true,
            None => tracing::debug!(source, dest, "coverage mark on undeclared edge ignored"),
        }
    }

    /// Whether an edge has been flagged covered
    #[must_use]
    pub fn is_covered(&self, source: &str, dest: &str) -> bool {
        self.edge_index(source, dest)
            .is_some_and(|edge| self.covered[edge.index()])
    }

    /// Clear every coverage flag
    pub fn reset_coverage(&mut self) {
        self.covered.fill(false);
    }

    /// Edges not yet covered, in declaration order
    #[must_use]
    pub fn uncovered_edges(&self) -> Vec<(&ServiceRef, &ServiceRef)> {
        self.inner
            .edge_references()
            .filter(|e| !self.covered[e.id().index()])
            .map(|e| (&self.inner[e.source()], &self.inner[e.target()]))
            .collect()
    }

    fn edge_index(&self, source: &str, dest: &str) -> Option<EdgeIndex> {
        let from = *self.by_name.get(source)?;
        let to = *self.by_name.get(dest)?;
        self.inner.find_edge(from, to)
    }
}

fn parse_ref(input: &str) -> Result<ServiceRef, ValidationError> {
    input
        .parse()
        .map_err(|e: ValidationError| ValidationError::MalformedTopology(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(refs: Vec<&ServiceRef>) -> Vec<&str> {
        refs.into_iter().map(ServiceRef::name).collect()
    }

    fn bookinfo() -> DependencyGraph {
        let topo = Topology::from_value(json!({
            "services": ["gateway", "productpage", "reviews:v2", "details", "ratings"],
            "dependencies": {
                "gateway": ["productpage"],
                "productpage": ["reviews", "details"],
                "reviews": ["ratings"]
            }
        }))
        .unwrap();
        DependencyGraph::from_topology(&topo).unwrap()
    }

    #[test]
    fn answers_dependency_queries() {
        let g = bookinfo();
        assert_eq!(g.service_count(), 5);
        assert_eq!(g.edge_count(), 4);
        assert_eq!(names(g.dependencies("productpage")), vec!["reviews", "details"]);
        assert_eq!(names(g.dependents("reviews")), vec!["productpage"]);
        assert!(g.dependencies("ratings").is_empty());
        assert!(g.dependents("nope").is_empty());
    }

    #[test]
    fn node_tags_come_from_declarations() {
        let g = bookinfo();
        assert_eq!(g.service("reviews").unwrap().to_string(), "reviews:v2");
    }

    #[test]
    fn cycles_and_self_loops_are_allowed() {
        let mut g = DependencyGraph::new();
        let a = ServiceRef::new("a");
        let b = ServiceRef::new("b");
        g.add_dependency(&a, &b).unwrap();
        g.add_dependency(&b, &a).unwrap();
        g.add_dependency(&a, &a).unwrap();
        assert_eq!(g.edge_count(), 3);
        assert!(g.has_edge("a", "a"));
    }

    #[test]
    fn identical_duplicate_edges_collapse() {
        let mut g = DependencyGraph::new();
        let a = ServiceRef::new("a");
        let b = ServiceRef::new("b");
        g.add_dependency(&a, &b).unwrap();
        g.add_dependency(&a, &b).unwrap();
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn conflicting_duplicate_edges_are_malformed() {
        let topo = Topology::from_value(json!({
            "dependencies": {"a": ["b:v1"], "c": ["d"]}
        }))
        .unwrap();
        let mut g = DependencyGraph::from_topology(&topo).unwrap();
        let err = g
            .add_dependency(&ServiceRef::new("a"), &ServiceRef::new("b"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedTopology(_)));
    }

    #[test]
    fn service_versions_collapse_into_one_node() {
        let topo = Topology::from_value(json!({
            "services": ["productpage", "reviews:v1", "reviews:v2", "ratings"],
            "dependencies": {"productpage": ["reviews"], "reviews": ["ratings"]}
        }))
        .unwrap();
        let g = DependencyGraph::from_topology(&topo).unwrap();
        assert_eq!(g.service_count(), 3);
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.service("reviews").unwrap().to_string(), "reviews:v1,v2");
        assert_eq!(names(g.dependents("reviews")), vec!["productpage"]);
    }

    #[test]
    fn versions_declared_on_both_edge_ends_collapse() {
        let topo = Topology::from_value(json!({
            "dependencies": {"productpage": ["reviews:v1"], "reviews:v2": ["ratings"]}
        }))
        .unwrap();
        let g = DependencyGraph::from_topology(&topo).unwrap();
        assert_eq!(g.service_count(), 3);
        assert_eq!(g.service("reviews").unwrap().tag_list().unwrap(), vec!["v1", "v2"]);
        assert!(g.has_edge("productpage", "reviews"));
        assert!(g.has_edge("reviews", "ratings"));
    }

    #[test]
    fn uncovered_edges_follow_document_order() {
        let topo = Topology::from_value(json!({
            "dependencies": {"zeta": ["a"], "alpha": ["b"], "mid": ["zeta", "alpha"]}
        }))
        .unwrap();
        let g = DependencyGraph::from_topology(&topo).unwrap();
        let order: Vec<(&str, &str)> = g
            .uncovered_edges()
            .into_iter()
            .map(|(s, d)| (s.name(), d.name()))
            .collect();
        assert_eq!(
            order,
            vec![("zeta", "a"), ("alpha", "b"), ("mid", "zeta"), ("mid", "alpha")]
        );
        assert_eq!(names(g.dependents("a")), vec!["zeta"]);
        assert_eq!(names(g.dependencies("mid")), vec!["zeta", "alpha"]);
    }

    #[test]
    fn nameless_service_is_malformed() {
        let topo = Topology::from_value(json!({"services": [{"tags": ["v1"]}]})).unwrap();
        assert!(matches!(
            DependencyGraph::from_topology(&topo),
            Err(ValidationError::MalformedTopology(_))
        ));
    }

    #[test]
    fn coverage_marks_and_resets() {
        let mut g = bookinfo();
        assert_eq!(g.uncovered_edges().len(), 4);

        g.mark_covered("productpage", "reviews");
        g.mark_covered("ratings", "gateway");
        assert!(g.is_covered("productpage", "reviews"));
        let uncovered: Vec<(&str, &str)> = g
            .uncovered_edges()
            .into_iter()
            .map(|(s, d)| (s.name(), d.name()))
            .collect();
        assert_eq!(
            uncovered,
            vec![
                ("gateway", "productpage"),
                ("productpage", "details"),
                ("reviews", "ratings")
            ]
        );

        g.reset_coverage();
        assert_eq!(g.uncovered_edges().len(), 4);
    }

    #[test]
    fn mark_covered_is_idempotent() {
        let mut once = bookinfo();
        let mut twice = bookinfo();
        once.mark_covered("gateway", "productpage");
        twice.mark_covered("gateway", "productpage");
        twice.mark_covered("gateway", "productpage");
        assert_eq!(once.uncovered_edges(), twice.uncovered_edges());
    }
}
