//! Gremlin Core - fault-injection recipes for service meshes
//!
//! The three pieces that do the work:
//! - [`DependencyGraph`]: who calls whom, plus per-edge coverage
//! - [`FailureGenerator`]: scenarios in, a fully covering rule batch out
//! - [`AssertionChecker`]: checklists in, pass/fail verdicts from request logs
//!
//! [`RecipeRun`] strings them together. Remote collaborators are reached
//! through the traits in [`transport`].
//!
//! # Example
//!
//! ```rust,ignore
//! use gremlin_core::prelude::*;
//!
//! let graph = DependencyGraph::from_topology(&Topology::load("topology.json")?)?;
//! let scenarios = ScenarioSet::load("gremlins.json")?;
//! let checklist = Checklist::load("checks.json")?;
//!
//! let generator = FailureGenerator::new(graph, control_plane, GeneratorConfig::default());
//! let report = RecipeRun::new(generator, log_store, RunConfig::default())
//!     .execute(&scenarios.gremlins, Some(&checklist), &mut NoLoad)?;
//! println!("{} of {} assertions passed", report.results.iter().filter(|r| r.success).count(), report.results.len());
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod assertion;
pub mod checker;
pub mod duration;
pub mod error;
pub mod generator;
pub mod graph;
pub mod orchestrator;
pub mod query;
pub mod routing;
pub mod rules;
pub mod scenario;
pub mod topology;
pub mod transport;
pub mod types;

pub use assertion::{AssertionKind, Assertion, AssertionResult, Check, Checklist, StatusSet};
pub use checker::{AssertionChecker, AssertionCheckerBuilder, Verdict, BASELINE_REQUEST_ALLOWANCE};
pub use duration::CompoundDuration;
pub use error::{DocumentError, GremlinError, Result, TransportError, ValidationError};
pub use generator::{FailureGenerator, GeneratorConfig, HeaderFilter, TeardownReport};
pub use graph::DependencyGraph;
pub use orchestrator::{RecipeRun, RunConfig, RunReport};
pub use query::{Bucket, LogFields, LogQuery, SearchResult, TimeWindow};
pub use routing::{ServiceInstance, ServiceVersions, TrafficPlan, TrafficShifter, VersionSelector};
pub use rules::{Action, FaultRule, Recipe, TRACE_LOG_KEY};
pub use scenario::{Scenario, ScenarioKind, ScenarioSet};
pub use topology::Topology;
pub use transport::{ControlPlane, LoadTrigger, LogStore, NoLoad, RoutingControl, ServiceRegistry, StoredRule};
pub use types::{RecipeId, ServiceRef};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running recipes
    pub use crate::{
        AssertionChecker, Checklist, ControlPlane, DependencyGraph, FailureGenerator,
        GeneratorConfig, GremlinError, LoadTrigger, LogStore, NoLoad, RecipeRun, RunConfig,
        ScenarioSet, Topology,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
