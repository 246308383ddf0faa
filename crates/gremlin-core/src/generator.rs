//! Failure generator: scenarios in, one covering rule batch out
//!
//! A generator owns one [`DependencyGraph`] and one [`Recipe`]. Every declared
//! edge ends up in exactly one rule of the batch: an active fault rule when a
//! scenario addressed it, otherwise a passive trace-only rule. Push is
//! fail-fast; teardown attempts every deletion and reports what failed.

use crate::duration::CompoundDuration;
use crate::error::{GremlinError, TransportError, ValidationError};
use crate::graph::DependencyGraph;
use crate::rules::{Action, FaultRule, Recipe, DEFAULT_RULE_PRIORITY};
use crate::scenario::{
    AbortParams, CrashParams, DelayParams, OverloadParams, PartitionParams, Scenario, ScenarioKind,
};
use crate::transport::ControlPlane;
use crate::types::{RecipeId, ServiceRef};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PROBABILITY: f64 = 1.0;
const DEFAULT_ABORT_CODE: i32 = -1;
const DEFAULT_CRASH_CODE: i32 = 0;
const DEFAULT_DELAY: Duration = Duration::from_secs(1);
const OVERLOAD_PROBABILITY: f64 = 0.5;
const OVERLOAD_DELAY: Duration = Duration::from_secs(10);
const OVERLOAD_CODE: i32 = 503;

/// Header a rule must see before it fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFilter {
    /// Request header name
    pub name: String,
    /// Regex the header value must match
    pub pattern: String,
}

impl HeaderFilter {
    /// Filter on `name` matching `pattern`
    #[must_use]
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }
}

/// Generator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Restrict every rule to requests carrying this header
    pub header: Option<HeaderFilter>,
    /// Priority of generated rules
    pub priority: i32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            header: None,
            priority: DEFAULT_RULE_PRIORITY,
        }
    }
}

/// Outcome of a teardown
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeardownReport {
    /// Remote ids deleted
    pub deleted: Vec<String>,
    /// Remote ids that could not be deleted, with the reason
    pub failed: Vec<(String, TransportError)>,
}

impl TeardownReport {
    /// Whether every deletion succeeded
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Abort/delay pair applied to one edge
#[derive(Debug, Clone, Copy)]
struct Faults {
    delay: Option<(f64, CompoundDuration)>,
    abort: Option<(f64, i32)>,
}

impl Faults {
    fn delay(probability: f64, duration: CompoundDuration) -> Self {
        Self {
            delay: Some((probability, duration)),
            abort: None,
        }
    }

    fn abort(probability: f64, code: i32) -> Self {
        Self {
            delay: None,
            abort: Some((probability, code)),
        }
    }
}

/// Turns scenarios into fault rules and manages their lifetime on the control plane
pub struct FailureGenerator {
    graph: DependencyGraph,
    recipe: Recipe,
    config: GeneratorConfig,
    control: Arc<dyn ControlPlane>,
}

impl FailureGenerator {
    /// Generator with a fresh recipe id
    #[must_use]
    pub fn new(graph: DependencyGraph, control: Arc<dyn ControlPlane>, config: GeneratorConfig) -> Self {
        Self::with_recipe(graph, control, config, Recipe::new())
    }

    /// Generator for an existing (empty) recipe
    #[must_use]
    pub fn with_recipe(
        graph: DependencyGraph,
        control: Arc<dyn ControlPlane>,
        config: GeneratorConfig,
        recipe: Recipe,
    ) -> Self {
        tracing::debug!(recipe = %recipe.id(), "failure generator created");
        Self {
            graph,
            recipe,
            config,
            control,
        }
    }

    /// Recipe id
    #[inline]
    #[must_use]
    pub fn recipe_id(&self) -> RecipeId {
        self.recipe.id()
    }

    /// Recipe state
    #[inline]
    #[must_use]
    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    /// Graph with the coverage of the last plan
    #[inline]
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Expand scenarios and push the resulting batch
    ///
    /// # Errors
    /// Validation errors before anything is sent, then the push error.
    pub fn setup_failures(&mut self, scenarios: &[Scenario]) -> Result<&[String], GremlinError> {
        self.plan(scenarios)?;
        self.push_rules()?;
        Ok(self.recipe.remote_rule_ids())
    }

    /// Expand scenarios into the rule batch without pushing it
    ///
    /// Coverage is reset first. On error the recipe keeps its previous rules.
    ///
    /// # Errors
    /// [`ValidationError::RecipeAlreadyPushed`] once rules are installed, or
    /// the first scenario error in declaration order.
    pub fn plan(&mut self, scenarios: &[Scenario]) -> Result<&[FaultRule], ValidationError> {
        if self.recipe.is_installed() {
            return Err(ValidationError::RecipeAlreadyPushed(self.recipe.id().to_string()));
        }
        self.graph.reset_coverage();

        let mut rules = Vec::new();
        for scenario in scenarios {
            scenario.validate()?;
            let before = rules.len();
            self.expand(scenario, &mut rules)?;
            tracing::debug!(
                scenario = %scenario.kind(),
                rules = rules.len() - before,
                "scenario expanded"
            );
        }

        let uncovered: Vec<(ServiceRef, ServiceRef)> = self
            .graph
            .uncovered_edges()
            .into_iter()
            .map(|(s, d)| (s.clone(), d.clone()))
            .collect();
        for (source, dest) in &uncovered {
            rules.push(self.passive_rule(source, dest));
        }

        tracing::info!(
            recipe = %self.recipe.id(),
            active = rules.len() - uncovered.len(),
            passive = uncovered.len(),
            "rule batch planned"
        );
        self.recipe.set_rules(rules);
        Ok(self.recipe.rules())
    }

    /// Push the planned batch in one request
    ///
    /// # Errors
    /// [`ValidationError::RecipeAlreadyPushed`] if already pushed,
    /// [`TransportError::PushFailed`] if the batch is rejected or the ids do
    /// not line up with the rules. No ids are stored on failure.
    pub fn push_rules(&mut self) -> Result<(), GremlinError> {
        if self.recipe.is_installed() {
            return Err(ValidationError::RecipeAlreadyPushed(self.recipe.id().to_string()).into());
        }
        let rules = self.recipe.rules();
        if rules.is_empty() {
            tracing::warn!(recipe = %self.recipe.id(), "no rules to push");
            return Ok(());
        }

        let ids = self.control.push_rules(rules).map_err(|e| {
            tracing::error!(recipe = %self.recipe.id(), error = %e, "rule push failed");
            e
        })?;
        if ids.len() != rules.len() {
            tracing::error!(expected = rules.len(), got = ids.len(), "rule id count mismatch");
            return Err(TransportError::PushFailed {
                status: 0,
                body: format!("expected {} rule ids, got {}", rules.len(), ids.len()),
            }
            .into());
        }

        tracing::info!(recipe = %self.recipe.id(), rules = ids.len(), "rules installed");
        self.recipe.set_remote_rule_ids(ids);
        Ok(())
    }

    /// Delete every installed rule, continuing past failures
    ///
    /// Ids that could not be deleted stay on the recipe so a later call can
    /// retry them.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for id in self.recipe.remote_rule_ids() {
            match self.control.delete_rule(id) {
                Ok(()) => report.deleted.push(id.clone()),
                Err(e) => {
                    tracing::warn!(rule = %id, error = %e, "rule delete failed");
                    report.failed.push((id.clone(), e));
                }
            }
        }
        let remaining: Vec<String> = report.failed.iter().map(|(id, _)| id.clone()).collect();
        self.recipe.set_remote_rule_ids(remaining);
        tracing::info!(
            recipe = %self.recipe.id(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "teardown finished"
        );
        report
    }

    /// Delete every rule tagged with the recipe id in one call
    ///
    /// # Errors
    /// Returns the control-plane error; remote ids are kept in that case.
    pub fn teardown_by_tag(&mut self) -> Result<(), TransportError> {
        self.control
            .delete_rules_by_tag(&self.recipe.id().to_string())?;
        self.recipe.set_remote_rule_ids(Vec::new());
        tracing::info!(recipe = %self.recipe.id(), "rules deleted by tag");
        Ok(())
    }

    fn expand(&mut self, scenario: &Scenario, rules: &mut Vec<FaultRule>) -> Result<(), ValidationError> {
        let kind = scenario.kind();
        match scenario {
            Scenario::DelayRequests(p) | Scenario::DelayResponses(p) => self.expand_delay(kind, p, rules),
            Scenario::AbortRequests(p) | Scenario::AbortResponses(p) => self.expand_abort(kind, p, rules),
            Scenario::PartitionServices(p) => self.expand_partition(p, rules),
            Scenario::CrashService(p) => self.expand_crash(p, rules),
            Scenario::OverloadService(p) => self.expand_overload(p, rules),
        }
    }

    fn expand_delay(
        &mut self,
        kind: ScenarioKind,
        p: &DelayParams,
        rules: &mut Vec<FaultRule>,
    ) -> Result<(), ValidationError> {
        let faults = Faults::delay(
            p.delayprobability.unwrap_or(DEFAULT_PROBABILITY),
            p.delaytime.unwrap_or_else(|| DEFAULT_DELAY.into()),
        );
        let edges = self.resolve_edges(kind, p.source.as_ref(), p.dest.as_ref())?;
        self.emit(&edges, faults, rules);
        Ok(())
    }

    fn expand_abort(
        &mut self,
        kind: ScenarioKind,
        p: &AbortParams,
        rules: &mut Vec<FaultRule>,
    ) -> Result<(), ValidationError> {
        let faults = Faults::abort(
            p.abortprobability.unwrap_or(DEFAULT_PROBABILITY),
            p.errorcode.unwrap_or(DEFAULT_ABORT_CODE),
        );
        let edges = self.resolve_edges(kind, p.source.as_ref(), p.dest.as_ref())?;
        self.emit(&edges, faults, rules);
        Ok(())
    }

    fn expand_partition(&mut self, p: &PartitionParams, rules: &mut Vec<FaultRule>) -> Result<(), ValidationError> {
        let kind = ScenarioKind::PartitionServices;
        let forward = self.resolve_edges(kind, p.source.as_ref(), p.dest.as_ref())?;
        let code = p.errorcode.unwrap_or(DEFAULT_ABORT_CODE);
        let backward: Vec<(ServiceRef, ServiceRef)> =
            forward.iter().map(|(s, d)| (d.clone(), s.clone())).collect();

        self.emit(
            &forward,
            Faults::abort(p.srcprobability.unwrap_or(DEFAULT_PROBABILITY), code),
            rules,
        );
        self.emit(
            &backward,
            Faults::abort(p.dstprobability.unwrap_or(DEFAULT_PROBABILITY), code),
            rules,
        );
        Ok(())
    }

    fn expand_crash(&mut self, p: &CrashParams, rules: &mut Vec<FaultRule>) -> Result<(), ValidationError> {
        let faults = Faults::abort(
            p.abortprobability.unwrap_or(DEFAULT_PROBABILITY),
            p.errorcode.unwrap_or(DEFAULT_CRASH_CODE),
        );
        let edges = self.resolve_edges(ScenarioKind::CrashService, None, p.dest.as_ref())?;
        self.emit(&edges, faults, rules);
        Ok(())
    }

    fn expand_overload(&mut self, p: &OverloadParams, rules: &mut Vec<FaultRule>) -> Result<(), ValidationError> {
        let faults = Faults {
            delay: Some((
                p.delayprobability.unwrap_or(OVERLOAD_PROBABILITY),
                p.delaytime.unwrap_or_else(|| OVERLOAD_DELAY.into()),
            )),
            abort: Some((
                p.abortprobability.unwrap_or(OVERLOAD_PROBABILITY),
                p.errorcode.unwrap_or(OVERLOAD_CODE),
            )),
        };
        let edges = self.resolve_edges(ScenarioKind::OverloadService, p.source.as_ref(), p.dest.as_ref())?;
        self.emit(&edges, faults, rules);
        Ok(())
    }

    /// Concrete edges addressed by a (source, dest) pair, either side optional
    ///
    /// Explicit tags on a scenario endpoint win over the graph node's tags.
    fn resolve_edges(
        &self,
        kind: ScenarioKind,
        source: Option<&ServiceRef>,
        dest: Option<&ServiceRef>,
    ) -> Result<Vec<(ServiceRef, ServiceRef)>, ValidationError> {
        let node = |wanted: &ServiceRef| -> Result<ServiceRef, ValidationError> {
            let declared = self
                .graph
                .service(wanted.name())
                .ok_or_else(|| ValidationError::UnknownService(wanted.name().to_string()))?;
            Ok(if wanted.is_tagged() {
                wanted.clone()
            } else {
                declared.clone()
            })
        };

        let edges = match (source, dest) {
            (Some(s), Some(d)) => {
                let (s, d) = (node(s)?, node(d)?);
                if !self.graph.has_edge(s.name(), d.name()) {
                    return Err(ValidationError::EdgeNotFound {
                        caller: s.name().to_string(),
                        callee: d.name().to_string(),
                    });
                }
                vec![(s, d)]
            }
            (Some(s), None) => {
                let s = node(s)?;
                self.graph
                    .dependencies(s.name())
                    .into_iter()
                    .map(|d| (s.clone(), d.clone()))
                    .collect()
            }
            (None, Some(d)) => {
                let d = node(d)?;
                self.graph
                    .dependents(d.name())
                    .into_iter()
                    .map(|s| (s.clone(), d.clone()))
                    .collect()
            }
            (None, None) => {
                return Err(ValidationError::InvalidScenario {
                    scenario: kind.to_string(),
                    reason: "at least one of 'source' or 'dest' is required".to_string(),
                })
            }
        };

        if edges.is_empty() {
            tracing::warn!(
                scenario = %kind,
                source = ?source.map(ServiceRef::name),
                dest = ?dest.map(ServiceRef::name),
                "scenario matched no edges"
            );
        }
        Ok(edges)
    }

    fn emit(&mut self, edges: &[(ServiceRef, ServiceRef)], faults: Faults, rules: &mut Vec<FaultRule>) {
        for (source, dest) in edges {
            let mut rule = self.passive_rule(source, dest);
            let tags = dest.tag_list();
            if let Some((probability, duration)) = faults.delay {
                rule.actions.push(Action::Delay {
                    probability,
                    duration: duration.as_secs_f64(),
                    tags: tags.clone(),
                });
            }
            if let Some((probability, return_code)) = faults.abort {
                rule.actions.push(Action::Abort {
                    probability,
                    return_code,
                    tags: tags.clone(),
                });
            }
            tracing::debug!(source = %source, dest = %dest, actions = rule.actions.len(), "fault rule built");
            rules.push(rule);
            self.graph.mark_covered(source.name(), dest.name());
        }
    }

    fn passive_rule(&self, source: &ServiceRef, dest: &ServiceRef) -> FaultRule {
        let headers: BTreeMap<String, String> = self
            .config
            .header
            .iter()
            .map(|h| (h.name.clone(), h.pattern.clone()))
            .collect();
        FaultRule::passive(self.recipe.id(), source, dest, headers, self.config.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;
    use crate::transport::MockControlPlane;
    use serde_json::json;

    fn graph() -> DependencyGraph {
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

    fn scenario(value: serde_json::Value) -> Scenario {
        Scenario::from_value(value).unwrap()
    }

    fn echoing_control() -> MockControlPlane {
        let mut control = MockControlPlane::new();
        control
            .expect_push_rules()
            .returning(|rules| Ok((0..rules.len()).map(|i| format!("rule-{i}")).collect()));
        control
    }

    fn generator(control: MockControlPlane) -> FailureGenerator {
        FailureGenerator::new(
            graph(),
            Arc::new(control),
            GeneratorConfig {
                header: Some(HeaderFilter::new("X-Request-ID", ".*?test")),
                ..GeneratorConfig::default()
            },
        )
    }

    #[test]
    fn delay_rule_shape() {
        let mut gen = generator(MockControlPlane::new());
        let rules = gen
            .plan(&[scenario(json!({
                "scenario": "delay_requests", "source": "productpage", "dest": "reviews", "delaytime": "1s500ms"
            }))])
            .unwrap()
            .to_vec();

        let rule = &rules[0];
        assert_eq!(rule.destination, "reviews");
        assert_eq!(rule.tags, vec![gen.recipe_id().to_string()]);
        assert_eq!(rule.matcher.headers["X-Request-ID"], ".*?test");
        assert!(rule.actions[0].is_trace());
        assert_eq!(
            rule.actions[1],
            Action::Delay {
                probability: 1.0,
                duration: 1.5,
                tags: Some(vec!["v2".to_string()])
            }
        );
    }

    #[test]
    fn overload_composes_delay_and_abort() {
        let mut gen = generator(MockControlPlane::new());
        let rules = gen
            .plan(&[scenario(json!({"scenario": "overload_service", "dest": "ratings"}))])
            .unwrap();
        let active: Vec<&FaultRule> = rules.iter().filter(|r| !r.is_passive()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(
            &active[0].actions[1..],
            &[
                Action::Delay { probability: 0.5, duration: 10.0, tags: None },
                Action::Abort { probability: 0.5, return_code: 503, tags: None }
            ]
        );
    }

    #[test]
    fn crash_uses_bodiless_close() {
        let mut gen = generator(MockControlPlane::new());
        let rules = gen
            .plan(&[scenario(json!({"scenario": "crash_service", "dest": "reviews"}))])
            .unwrap();
        let crash = rules.iter().find(|r| !r.is_passive()).unwrap();
        assert_eq!(crash.source_name(), Some("productpage"));
        assert!(matches!(crash.actions[1], Action::Abort { return_code: 0, .. }));
    }

    #[test]
    fn validation_happens_before_any_push() {
        let mut control = MockControlPlane::new();
        control.expect_push_rules().never();
        let mut gen = generator(control);

        let unknown = scenario(json!({"scenario": "abort_requests", "source": "nobody"}));
        assert_eq!(
            gen.setup_failures(&[unknown]).unwrap_err().to_string(),
            "validation failed: unknown service: 'nobody'"
        );

        let missing_edge = scenario(json!({"scenario": "abort_requests", "source": "ratings", "dest": "gateway"}));
        assert!(matches!(
            gen.setup_failures(&[missing_edge]),
            Err(GremlinError::Validation(ValidationError::EdgeNotFound { .. }))
        ));
        assert!(!gen.recipe().is_installed());
    }

    #[test]
    fn push_stores_ids_and_refuses_second_run() {
        let mut gen = generator(echoing_control());
        let ids = gen
            .setup_failures(&[scenario(json!({"scenario": "abort_requests", "dest": "reviews"}))])
            .unwrap()
            .to_vec();
        assert_eq!(ids.len(), gen.recipe().rules().len());
        assert_eq!(ids[0], "rule-0");

        let err = gen.plan(&[]).unwrap_err();
        assert!(matches!(err, ValidationError::RecipeAlreadyPushed(_)));
    }

    #[test]
    fn push_failure_leaves_no_remote_ids() {
        let mut control = MockControlPlane::new();
        control.expect_push_rules().returning(|_| {
            Err(TransportError::PushFailed {
                status: 500,
                body: "boom".into(),
            })
        });
        let mut gen = generator(control);
        let err = gen.setup_failures(&[]).unwrap_err();
        assert!(err.is_transport());
        assert!(gen.recipe().remote_rule_ids().is_empty());
    }

    #[test]
    fn id_count_mismatch_is_push_failure() {
        let mut control = MockControlPlane::new();
        control.expect_push_rules().returning(|_| Ok(vec!["only-one".into()]));
        let mut gen = generator(control);
        let err = gen.setup_failures(&[]).unwrap_err();
        assert!(matches!(
            err,
            GremlinError::Transport(TransportError::PushFailed { .. })
        ));
        assert!(!gen.recipe().is_installed());
    }

    #[test]
    fn teardown_continues_past_failures_and_keeps_failed_ids() {
        let mut control = echoing_control();
        control.expect_delete_rule().returning(|id| {
            if id == "rule-1" {
                Err(TransportError::unreachable("cp", "reset"))
            } else {
                Ok(())
            }
        });
        let mut gen = generator(control);
        gen.setup_failures(&[]).unwrap();
        let total = gen.recipe().remote_rule_ids().len();

        let report = gen.teardown();
        assert!(!report.is_clean());
        assert_eq!(report.deleted.len(), total - 1);
        assert_eq!(report.failed[0].0, "rule-1");
        assert_eq!(gen.recipe().remote_rule_ids(), ["rule-1".to_string()]);
    }

    #[test]
    fn teardown_by_tag_uses_recipe_id() {
        let mut control = echoing_control();
        let expected = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let seen = expected.clone();
        control.expect_delete_rules_by_tag().times(1).returning(move |tag| {
            *seen.lock().unwrap() = tag.to_string();
            Ok(())
        });
        let mut gen = generator(control);
        gen.setup_failures(&[]).unwrap();
        gen.teardown_by_tag().unwrap();
        assert_eq!(*expected.lock().unwrap(), gen.recipe_id().to_string());
        assert!(!gen.recipe().is_installed());
    }
}
