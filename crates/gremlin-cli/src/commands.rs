//! Command implementations, independent of argument parsing
//!
//! Collaborators come in as trait objects so every command can run against
//! the in-memory stubs in tests.

use crate::output::ServiceSummary;
use anyhow::Context;
use chrono::{DateTime, Utc};
use gremlin_core::routing::{version_counts, TrafficPlan};
use gremlin_core::{
    AssertionChecker, AssertionResult, Checklist, ControlPlane, DependencyGraph, FailureGenerator,
    FaultRule, GeneratorConfig, HeaderFilter, LoadTrigger, LogStore, RecipeId, RecipeRun,
    RunConfig, RunReport, ScenarioSet, ServiceRegistry, Topology, TrafficShifter,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Request-tracking header used when none is given
pub(crate) const DEFAULT_HEADER: &str = "X-Request-ID";

/// Rule header regex for a user pattern; a bare `*` matches every value
pub(crate) fn header_regex(pattern: &str) -> String {
    if pattern == "*" {
        ".*".to_string()
    } else {
        format!(".*?{pattern}")
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecipeArgs {
    pub(crate) topology: PathBuf,
    pub(crate) scenarios: PathBuf,
    pub(crate) checks: Option<PathBuf>,
    pub(crate) header: String,
    pub(crate) pattern: String,
    pub(crate) dry_run: bool,
    pub(crate) run: RunConfig,
}

#[derive(Debug)]
pub(crate) enum RecipeOutcome {
    /// `--dry-run`: the rules that would have been pushed
    Planned(Vec<FaultRule>),
    Ran(RunReport),
}

/// Load the recipe documents, then plan them (`dry_run`) or run them end to end
///
/// `store_for` receives the checklist's `log_server` override.
pub(crate) fn recipe_run(
    args: &RecipeArgs,
    control: Arc<dyn ControlPlane>,
    store_for: impl FnOnce(Option<&str>) -> anyhow::Result<Arc<dyn LogStore>>,
    load: &mut dyn LoadTrigger,
) -> anyhow::Result<RecipeOutcome> {
    let topology = Topology::load(&args.topology)
        .with_context(|| format!("loading topology {}", args.topology.display()))?;
    let graph = DependencyGraph::from_topology(&topology)?;
    let scenarios = ScenarioSet::load(&args.scenarios)
        .with_context(|| format!("loading scenarios {}", args.scenarios.display()))?;
    let checklist = args
        .checks
        .as_ref()
        .map(|path| Checklist::load(path).with_context(|| format!("loading checklist {}", path.display())))
        .transpose()?;

    tracing::debug!(
        services = graph.service_count(),
        edges = graph.edge_count(),
        scenarios = scenarios.len(),
        "recipe inputs loaded"
    );

    let config = GeneratorConfig {
        header: Some(HeaderFilter::new(&args.header, header_regex(&args.pattern))),
        ..GeneratorConfig::default()
    };
    let mut generator = FailureGenerator::new(graph, control, config);

    if args.dry_run {
        let rules = generator.plan(&scenarios.gremlins)?.to_vec();
        return Ok(RecipeOutcome::Planned(rules));
    }

    let store = store_for(checklist.as_ref().and_then(|c| c.log_server.as_deref()))?;
    let report = RecipeRun::new(generator, store, args.run.clone()).execute(
        &scenarios.gremlins,
        checklist.as_ref(),
        load,
    )?;
    Ok(RecipeOutcome::Ran(report))
}

#[derive(Debug, Clone)]
pub(crate) struct CheckArgs {
    pub(crate) checks: PathBuf,
    pub(crate) recipe: Option<RecipeId>,
    pub(crate) header: String,
    pub(crate) pattern: Option<String>,
    pub(crate) since: Option<DateTime<Utc>>,
    pub(crate) until: Option<DateTime<Utc>>,
    pub(crate) stop_on_failure: bool,
}

/// Re-evaluate a checklist against logs that are already there
///
/// `store_for` receives the checklist's `log_server` override.
pub(crate) fn check(
    args: &CheckArgs,
    store_for: impl FnOnce(Option<&str>) -> anyhow::Result<Arc<dyn LogStore>>,
) -> anyhow::Result<Vec<AssertionResult>> {
    let checklist = Checklist::load(&args.checks)
        .with_context(|| format!("loading checklist {}", args.checks.display()))?;
    let store = store_for(checklist.log_server.as_deref())?;

    let mut builder = AssertionChecker::builder(store).window(args.since, args.until);
    if let Some(recipe) = args.recipe {
        builder = builder.recipe(recipe);
    }
    if let Some(pattern) = &args.pattern {
        builder = builder.header(args.header.clone(), header_regex(pattern));
    }
    let checker = builder
        .build()
        .context("pass --recipe or --pattern to scope the check")?;
    Ok(checker.check_assertions(&checklist, !args.stop_on_failure)?)
}

/// Every registered service with its instance count per version
pub(crate) fn service_list(registry: &dyn ServiceRegistry) -> anyhow::Result<Vec<ServiceSummary>> {
    let mut summaries = Vec::new();
    for service in registry.list_services()? {
        let instances = registry.instances(&service)?;
        let counts = version_counts(&instances)
            .into_iter()
            .map(|(version, count)| format!("{version}({count})"))
            .collect();
        summaries.push(ServiceSummary {
            service,
            instances: counts,
        });
    }
    Ok(summaries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TrafficCommand {
    Start { version: String, amount: u32 },
    Step { amount: Option<u32> },
    Abort,
}

/// Apply a traffic shift and describe the outcome
pub(crate) fn traffic(shifter: &TrafficShifter, service: &str, command: &TrafficCommand) -> anyhow::Result<String> {
    let message = match command {
        TrafficCommand::Start { version, amount } => {
            let plan = shifter.start(service, version, *amount)?;
            describe(service, &plan, "starting")
        }
        TrafficCommand::Step { amount } => {
            let plan = shifter.step(service, *amount)?;
            describe(service, &plan, "step")
        }
        TrafficCommand::Abort => {
            let plan = shifter.abort(service)?;
            format!("Transfer aborted for {service}: all traffic reverted to {}", plan.to)
        }
    };
    Ok(message)
}

fn describe(service: &str, plan: &TrafficPlan, phase: &str) -> String {
    if plan.is_complete() {
        format!(
            "Transfer complete for {service}: sending {}% of traffic to {}",
            plan.percent, plan.to
        )
    } else {
        format!(
            "Transfer {phase} for {service}: diverting {}% of traffic from {} to {}",
            plan.percent, plan.from, plan.to
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gremlin_core::routing::ServiceVersions;
    use gremlin_core::{ControlPlane, RoutingControl};
    use gremlin_test_utils::{bookinfo_json, trace, InMemoryLogStore, StubControlPlane, StubRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write as _;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Files {
        _dir: tempfile::TempDir,
        topology: PathBuf,
        scenarios: PathBuf,
        checks: PathBuf,
    }

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    fn files() -> Files {
        let dir = tempfile::tempdir().unwrap();
        let topology = write(&dir, "topology.json", &bookinfo_json().to_string());
        let scenarios = write(
            &dir,
            "gremlins.yaml",
            "gremlins:\n  - scenario: abort_requests\n    source: productpage\n    dest: reviews\n    errorcode: 503\n",
        );
        let checks = write(
            &dir,
            "checks.json",
            &json!({"log_server": "es.override:9200", "checks": [
                {"name": "http_status", "source": "productpage", "dest": "reviews", "status": 503}
            ]})
            .to_string(),
        );
        Files {
            _dir: dir,
            topology,
            scenarios,
            checks,
        }
    }

    fn args(files: &Files) -> RecipeArgs {
        RecipeArgs {
            topology: files.topology.clone(),
            scenarios: files.scenarios.clone(),
            checks: Some(files.checks.clone()),
            header: DEFAULT_HEADER.to_string(),
            pattern: "test-7".to_string(),
            dry_run: false,
            run: RunConfig {
                propagation_grace: Duration::ZERO,
                flush_interval: Duration::ZERO,
                continue_on_error: true,
            },
        }
    }

    #[test]
    fn test_header_regex() {
        assert_eq!(header_regex("*"), ".*");
        assert_eq!(header_regex("test-7"), ".*?test-7");
    }

    #[test]
    fn test_dry_run_plans_without_pushing() {
        let files = files();
        let control = Arc::new(StubControlPlane::new());
        let mut recipe = args(&files);
        recipe.dry_run = true;

        let outcome = recipe_run(
            &recipe,
            control.clone(),
            |_| panic!("a dry run never queries logs"),
            &mut gremlin_core::NoLoad,
        )
        .unwrap();
        let RecipeOutcome::Planned(rules) = outcome else {
            panic!("expected a plan");
        };
        assert_eq!(rules.len(), 4);
        assert!(rules
            .iter()
            .all(|r| r.matcher.headers.get(DEFAULT_HEADER).map(String::as_str) == Some(".*?test-7")));
        assert_eq!(control.push_count(), 0);
    }

    /// Load that answers every installed rule's recipe with one 503 trace
    struct TrafficFromRules {
        control: Arc<StubControlPlane>,
        store: Arc<InMemoryLogStore>,
    }

    impl LoadTrigger for TrafficFromRules {
        fn trigger(&mut self) -> Result<(), String> {
            let tag = self
                .control
                .stored_rules()
                .first()
                .and_then(|r| r.rule.tags.first().cloned())
                .ok_or("no rules installed")?;
            let recipe: RecipeId = tag.parse().map_err(|e| format!("{e}"))?;
            self.store
                .push(trace(recipe, "productpage", "reviews").status(503).build());
            Ok(())
        }
    }

    #[test]
    fn test_recipe_run_uses_checklist_log_server() {
        let files = files();
        let control = Arc::new(StubControlPlane::new());
        let store = Arc::new(InMemoryLogStore::new());
        let seen_server = Arc::new(Mutex::new(None::<String>));

        let factory = {
            let store = store.clone();
            let seen_server = seen_server.clone();
            move |server: Option<&str>| {
                *seen_server.lock().unwrap() = server.map(str::to_string);
                Ok(store as Arc<dyn LogStore>)
            }
        };
        let mut load = TrafficFromRules {
            control: control.clone(),
            store,
        };

        let outcome = recipe_run(&args(&files), control.clone(), factory, &mut load).unwrap();
        let RecipeOutcome::Ran(report) = outcome else {
            panic!("expected a run");
        };
        assert_eq!(seen_server.lock().unwrap().as_deref(), Some("es.override:9200"));
        assert_eq!(report.rules_installed, 4);
        assert!(report.all_passed(), "{:?}", report.results);
        assert!(control.list_rules().unwrap().is_empty());
    }

    #[test]
    fn test_check_needs_a_scope() {
        let files = files();
        let err = check(
            &CheckArgs {
                checks: files.checks.clone(),
                recipe: None,
                header: DEFAULT_HEADER.to_string(),
                pattern: None,
                since: None,
                until: None,
                stop_on_failure: false,
            },
            |_| Ok(Arc::new(InMemoryLogStore::new()) as Arc<dyn LogStore>),
        )
        .unwrap_err();
        assert!(err.to_string().contains("--recipe or --pattern"));
    }

    #[test]
    fn test_check_by_recipe() {
        let files = files();
        let recipe = RecipeId::new();
        let store = Arc::new(InMemoryLogStore::with_docs([
            trace(recipe, "productpage", "reviews").status(503).build(),
        ]));
        let results = check(
            &CheckArgs {
                checks: files.checks.clone(),
                recipe: Some(recipe),
                header: DEFAULT_HEADER.to_string(),
                pattern: None,
                since: None,
                until: None,
                stop_on_failure: false,
            },
            move |_| Ok(store as Arc<dyn LogStore>),
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }

    #[test]
    fn test_service_list_counts_versions() {
        let registry = StubRegistry::new()
            .with_instance("reviews", Some("v1"))
            .with_instance("reviews", Some("v2"))
            .with_instance("reviews", Some("v2"))
            .with_instance("ratings", None);
        let summaries = service_list(&registry).unwrap();
        assert_eq!(
            summaries,
            vec![
                ServiceSummary {
                    service: "ratings".into(),
                    instances: vec!["UNVERSIONED(1)".into()],
                },
                ServiceSummary {
                    service: "reviews".into(),
                    instances: vec!["v1(1)".into(), "v2(2)".into()],
                },
            ]
        );
    }

    #[test]
    fn test_traffic_messages() {
        let control = Arc::new(StubControlPlane::new());
        control.seed_versions(
            "reviews",
            ServiceVersions {
                default: Some("v1".into()),
                selectors: None,
            },
        );
        let registry = Arc::new(
            StubRegistry::new()
                .with_instance("reviews", Some("v1"))
                .with_instance("reviews", Some("v2")),
        );
        let shifter = TrafficShifter::new(control.clone(), registry);

        let started = traffic(
            &shifter,
            "reviews",
            &TrafficCommand::Start {
                version: "v2".into(),
                amount: 10,
            },
        )
        .unwrap();
        assert_eq!(started, "Transfer starting for reviews: diverting 10% of traffic from v1 to v2");

        let stepped = traffic(&shifter, "reviews", &TrafficCommand::Step { amount: None }).unwrap();
        assert_eq!(stepped, "Transfer step for reviews: diverting 20% of traffic from v1 to v2");

        let aborted = traffic(&shifter, "reviews", &TrafficCommand::Abort).unwrap();
        assert_eq!(aborted, "Transfer aborted for reviews: all traffic reverted to v1");
        assert!(!control.get_versions("reviews").unwrap().unwrap().is_split());
    }
}
