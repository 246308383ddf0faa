//! End-to-end recipe run
//!
//! push rules → wait for propagation → trigger load → wait for log flush →
//! check assertions → tear down. Teardown is attempted whenever rules were
//! installed, whether the later steps succeed or not.

use crate::assertion::{AssertionResult, Checklist};
use crate::checker::AssertionChecker;
use crate::error::GremlinError;
use crate::generator::{FailureGenerator, TeardownReport};
use crate::query::LogFields;
use crate::scenario::Scenario;
use crate::transport::{LoadTrigger, LogStore};
use crate::types::RecipeId;
use std::sync::Arc;
use std::time::Duration;

/// Timing and evaluation policy of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Wait after the push before load starts
    pub propagation_grace: Duration,
    /// Wait after load before logs are queried
    pub flush_interval: Duration,
    /// Evaluate every assertion even after a failure
    pub continue_on_error: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            propagation_grace: Duration::from_secs(3),
            flush_interval: Duration::from_secs(5),
            continue_on_error: true,
        }
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Recipe of the run
    pub recipe_id: RecipeId,
    /// Number of rules that were installed
    pub rules_installed: usize,
    /// Assertion results, in checklist order
    pub results: Vec<AssertionResult>,
    /// Outcome of rule removal
    pub teardown: TeardownReport,
}

impl RunReport {
    /// Whether every evaluated assertion held
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

/// Drives one recipe from rule push to teardown
pub struct RecipeRun {
    generator: FailureGenerator,
    store: Arc<dyn LogStore>,
    fields: LogFields,
    config: RunConfig,
}

impl RecipeRun {
    /// Run over `generator`, checking assertions against `store`
    #[must_use]
    pub fn new(generator: FailureGenerator, store: Arc<dyn LogStore>, config: RunConfig) -> Self {
        Self {
            generator,
            store,
            fields: LogFields::default(),
            config,
        }
    }

    /// Override log document field names
    #[must_use]
    pub fn with_fields(mut self, fields: LogFields) -> Self {
        self.fields = fields;
        self
    }

    /// Recipe id of this run
    #[must_use]
    pub fn recipe_id(&self) -> RecipeId {
        self.generator.recipe_id()
    }

    /// Execute the run
    ///
    /// # Errors
    /// Validation and push errors before anything is installed; load and
    /// log-store errors after rules were torn down.
    pub fn execute(
        mut self,
        scenarios: &[Scenario],
        checklist: Option<&Checklist>,
        load: &mut dyn LoadTrigger,
    ) -> Result<RunReport, GremlinError> {
        let recipe_id = self.generator.recipe_id();
        tracing::info!(recipe = %recipe_id, scenarios = scenarios.len(), "recipe run starting");

        if let Err(e) = self.generator.setup_failures(scenarios) {
            if self.generator.recipe().is_installed() {
                self.generator.teardown();
            }
            return Err(e);
        }
        let rules_installed = self.generator.recipe().remote_rule_ids().len();

        match self.drive(checklist, load) {
            Ok(results) => {
                let teardown = self.generator.teardown();
                Ok(RunReport {
                    recipe_id,
                    rules_installed,
                    results,
                    teardown,
                })
            }
            Err(e) => {
                tracing::error!(recipe = %recipe_id, error = %e, "recipe run failed, tearing down");
                self.generator.teardown();
                Err(e)
            }
        }
    }

    fn drive(
        &self,
        checklist: Option<&Checklist>,
        load: &mut dyn LoadTrigger,
    ) -> Result<Vec<AssertionResult>, GremlinError> {
        pause("rule propagation", self.config.propagation_grace);
        load.trigger().map_err(GremlinError::LoadFailed)?;
        pause("log flush", self.config.flush_interval);

        let Some(checklist) = checklist else {
            return Ok(Vec::new());
        };
        let checker = AssertionChecker::builder(self.store.clone())
            .recipe(self.generator.recipe_id())
            .fields(self.fields.clone())
            .build()?;
        Ok(checker.check_assertions(checklist, self.config.continue_on_error)?)
    }
}

fn pause(reason: &str, duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tracing::info!(reason, seconds = duration.as_secs_f64(), "waiting");
    std::thread::sleep(duration);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratorConfig;
    use crate::graph::DependencyGraph;
    use crate::query::SearchResult;
    use crate::transport::{MockControlPlane, MockLogStore};
    use crate::types::ServiceRef;
    use serde_json::json;

    struct FailingLoad;

    impl LoadTrigger for FailingLoad {
        fn trigger(&mut self) -> Result<(), String> {
            Err("script exited with status 2".to_string())
        }
    }

    fn instant() -> RunConfig {
        RunConfig {
            propagation_grace: Duration::ZERO,
            flush_interval: Duration::ZERO,
            continue_on_error: true,
        }
    }

    #[test]
    fn load_failure_still_tears_down() {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(&ServiceRef::new("a"), &ServiceRef::new("b"))
            .unwrap();

        let mut control = MockControlPlane::new();
        control.expect_push_rules().returning(|_| Ok(vec!["r0".into()]));
        control.expect_delete_rule().times(1).returning(|_| Ok(()));
        let store = MockLogStore::new();

        let generator = FailureGenerator::new(graph, Arc::new(control), GeneratorConfig::default());
        let run = RecipeRun::new(generator, Arc::new(store), instant());
        let err = run.execute(&[], None, &mut FailingLoad).unwrap_err();
        assert!(matches!(err, GremlinError::LoadFailed(_)));
    }

    #[test]
    fn checklist_runs_against_recipe_scope() {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(&ServiceRef::new("a"), &ServiceRef::new("b"))
            .unwrap();

        let mut control = MockControlPlane::new();
        control.expect_push_rules().returning(|_| Ok(vec!["r0".into()]));
        control.expect_delete_rule().returning(|_| Ok(()));
        let mut store = MockLogStore::new();
        store.expect_search().returning(|_| {
            Ok(SearchResult {
                total: 1,
                hits: vec![json!({"status": 200})],
                buckets: Vec::new(),
            })
        });

        let generator = FailureGenerator::new(graph, Arc::new(control), GeneratorConfig::default());
        let checklist = Checklist::from_value(json!({"checks": [
            {"name": "http_status", "source": "a", "dest": "b", "status": 200}
        ]}))
        .unwrap();
        let report = RecipeRun::new(generator, Arc::new(store), instant())
            .execute(&[], Some(&checklist), &mut crate::transport::NoLoad)
            .unwrap();
        assert_eq!(report.rules_installed, 1);
        assert!(report.all_passed());
        assert!(report.teardown.is_clean());
    }
}
