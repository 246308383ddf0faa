//! Error types for Gremlin
//!
//! Three families, matching how a run can go wrong:
//! - [`ValidationError`]: caller mistakes, always detected before any network call
//! - [`TransportError`]: the control plane, registry or log store misbehaved
//! - [`DocumentError`]: a topology/scenario/checklist file could not be read
//!
//! A failing assertion is not an error; it is an
//! [`AssertionResult`](crate::assertion::AssertionResult) with `success == false`.

use std::path::PathBuf;

/// Main Gremlin error type
#[derive(Debug, thiserror::Error)]
pub enum GremlinError {
    /// Invalid input, rejected before any side effect
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Control plane, registry or log store failure
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// Input document could not be loaded
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// The load trigger reported a failure; assertions were not run
    #[error("load injection failed: {0}")]
    LoadFailed(String),
}

impl GremlinError {
    /// Check if the error was raised before any network call
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Document(_))
    }

    /// Check if the error came from a remote collaborator
    #[inline]
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Caller errors: bad topology, scenario, checklist or scope
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Topology document is structurally invalid
    #[error("malformed topology: {0}")]
    MalformedTopology(String),

    /// Service reference string could not be parsed
    #[error("invalid service reference '{input}': {reason}")]
    InvalidServiceRef { input: String, reason: String },

    /// Scenario name is not one of the supported scenarios
    #[error("unknown scenario: '{0}'")]
    UnknownScenario(String),

    /// Scenario parameters are missing or out of range
    #[error("invalid scenario {scenario}: {reason}")]
    InvalidScenario { scenario: String, reason: String },

    /// Scenario names a service absent from the topology
    #[error("unknown service: '{0}'")]
    UnknownService(String),

    /// Scenario names an explicit edge absent from the topology
    #[error("no dependency from '{caller}' to '{callee}' in topology")]
    EdgeNotFound { caller: String, callee: String },

    /// Rules were already pushed for this recipe
    #[error("recipe {0} already has rules installed")]
    RecipeAlreadyPushed(String),

    /// Assertion checker needs a recipe id or a header pattern
    #[error("assertion checker requires a recipe id or a header pattern")]
    MissingScopeIdentity,

    /// Assertion name is not one of the supported predicates
    #[error("unknown assertion: '{0}'")]
    UnknownAssertion(String),

    /// Assertion parameters are missing or malformed
    #[error("invalid assertion {name}: {reason}")]
    InvalidAssertion { name: String, reason: String },

    /// Compound duration string could not be parsed
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    /// Version selector could not be parsed
    #[error("invalid version selector '{input}': {reason}")]
    InvalidSelector { input: String, reason: String },

    /// Traffic shift requested from an incompatible routing state
    #[error("invalid traffic state for {service}: {reason}")]
    InvalidTrafficState { service: String, reason: String },

    /// Traffic percentage outside 0-100
    #[error("traffic amount must be between 0 and 100, got {0}")]
    InvalidTrafficAmount(u32),
}

/// Remote collaborator errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// Endpoint could not be reached at all
    #[error("could not communicate with {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// Rule batch was rejected by the control plane
    #[error("rule push rejected (status {status}): {body}")]
    PushFailed { status: u16, body: String },

    /// Endpoint answered with a status the caller did not expect
    #[error("{endpoint} answered with status {status}: {body}")]
    UnexpectedStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Response body did not have the expected shape
    #[error("malformed response from {endpoint}: {reason}")]
    MalformedResponse { endpoint: String, reason: String },
}

impl TransportError {
    /// Create unreachable error for an endpoint
    pub fn unreachable(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Unreachable {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Create malformed response error for an endpoint
    pub fn malformed(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::MalformedResponse {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors while loading an input document from disk
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// IO error during file read
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON syntax error
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// YAML syntax error
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Result alias used across the crate
pub type Result<T, E = GremlinError> = std::result::Result<T, E>;
