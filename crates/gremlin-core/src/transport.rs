//! Collaborator seams: control plane, log store, service registry and load
//!
//! The core only talks to the outside world through these traits. Blocking
//! HTTP implementations live in `gremlin-http`; in-memory stubs for tests
//! live in `gremlin-test-utils`.

use crate::error::TransportError;
use crate::query::{LogQuery, SearchResult};
use crate::routing::{ServiceInstance, ServiceVersions};
use crate::rules::FaultRule;
use serde::{Deserialize, Serialize};

/// A rule as listed by the control plane, with its remote id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRule {
    /// Remote rule id
    pub id: String,
    /// Rule body
    #[serde(flatten)]
    pub rule: FaultRule,
}

/// Fault-rule storage of the mesh control plane
#[cfg_attr(test, mockall::automock)]
pub trait ControlPlane: Send + Sync {
    /// Install a batch of rules; returns one remote id per rule, in order
    ///
    /// # Errors
    /// [`TransportError::PushFailed`] when the batch is rejected.
    fn push_rules(&self, rules: &[FaultRule]) -> Result<Vec<String>, TransportError>;

    /// Delete one rule by remote id
    ///
    /// # Errors
    /// Returns an error if the control plane cannot be reached or refuses.
    fn delete_rule(&self, id: &str) -> Result<(), TransportError>;

    /// Delete every rule carrying `tag`
    ///
    /// # Errors
    /// Returns an error if the control plane cannot be reached or refuses.
    fn delete_rules_by_tag(&self, tag: &str) -> Result<(), TransportError>;

    /// All installed rules
    ///
    /// # Errors
    /// Returns an error if the control plane cannot be reached or refuses.
    fn list_rules(&self) -> Result<Vec<StoredRule>, TransportError>;

    /// Remove every installed rule
    ///
    /// # Errors
    /// Returns an error if the control plane cannot be reached or refuses.
    fn clear_rules(&self) -> Result<(), TransportError>;
}

/// Version routing of the mesh control plane
#[cfg_attr(test, mockall::automock)]
pub trait RoutingControl: Send + Sync {
    /// Current routing of `service`, `None` when it has none
    ///
    /// # Errors
    /// Returns an error if the control plane cannot be reached or refuses.
    fn get_versions(&self, service: &str) -> Result<Option<ServiceVersions>, TransportError>;

    /// Replace the routing of `service`
    ///
    /// # Errors
    /// Returns an error if the control plane cannot be reached or refuses.
    fn set_versions(&self, service: &str, versions: &ServiceVersions) -> Result<(), TransportError>;
}

/// Searchable store of request-trace documents
#[cfg_attr(test, mockall::automock)]
pub trait LogStore: Send + Sync {
    /// Run a query
    ///
    /// # Errors
    /// Returns an error if the store cannot be reached or answers garbage.
    fn search(&self, query: &LogQuery) -> Result<SearchResult, TransportError>;
}

/// Registry of live service instances
#[cfg_attr(test, mockall::automock)]
pub trait ServiceRegistry: Send + Sync {
    /// Registered service names
    ///
    /// # Errors
    /// Returns an error if the registry cannot be reached or refuses.
    fn list_services(&self) -> Result<Vec<String>, TransportError>;

    /// Live instances of `service`
    ///
    /// # Errors
    /// Returns an error if the registry cannot be reached or refuses.
    fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>, TransportError>;
}

/// Starts test traffic once rules are in place
pub trait LoadTrigger {
    /// Drive load and return when it has finished
    ///
    /// # Errors
    /// A human-readable reason when load could not be generated.
    fn trigger(&mut self) -> Result<(), String>;
}

/// Load trigger that does nothing, for runs where traffic is already flowing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLoad;

impl LoadTrigger for NoLoad {
    fn trigger(&mut self) -> Result<(), String> {
        tracing::debug!("no load trigger configured");
        Ok(())
    }
}
