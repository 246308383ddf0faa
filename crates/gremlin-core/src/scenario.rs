//! Failure scenario declarations
//!
//! A scenario document lists gremlins by name, each with its own parameters:
//!
//! ```json
//! {"gremlins": [
//!   {"scenario": "delay_requests", "source": "productpage", "dest": "reviews", "delaytime": "2s"},
//!   {"scenario": "crash_service", "dest": "ratings"}
//! ]}
//! ```
//!
//! Empty `source`/`dest` strings are treated as absent.

use crate::duration::CompoundDuration;
use crate::error::ValidationError;
use crate::topology::load_document;
use crate::types::ServiceRef;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Supported scenario names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    /// Delay calls on the request path
    DelayRequests,
    /// Delay calls on the response path
    DelayResponses,
    /// Abort calls on the request path
    AbortRequests,
    /// Abort calls on the response path
    AbortResponses,
    /// Cut both directions of one edge
    PartitionServices,
    /// Make a service fail for every caller
    CrashService,
    /// Make a service look saturated to its callers
    OverloadService,
}

impl ScenarioKind {
    /// All kinds, in documentation order
    pub const ALL: [Self; 7] = [
        Self::DelayRequests,
        Self::DelayResponses,
        Self::AbortRequests,
        Self::AbortResponses,
        Self::PartitionServices,
        Self::CrashService,
        Self::OverloadService,
    ];

    /// Name used in scenario documents
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DelayRequests => "delay_requests",
            Self::DelayResponses => "delay_responses",
            Self::AbortRequests => "abort_requests",
            Self::AbortResponses => "abort_responses",
            Self::PartitionServices => "partition_services",
            Self::CrashService => "crash_service",
            Self::OverloadService => "overload_service",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownScenario(s.to_string()))
    }
}

/// Parameters of `delay_requests` / `delay_responses`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DelayParams {
    /// Calling service; absent means every caller of `dest`
    #[serde(default, deserialize_with = "optional_service")]
    pub source: Option<ServiceRef>,
    /// Called service; absent means every callee of `source`
    #[serde(default, deserialize_with = "optional_service")]
    pub dest: Option<ServiceRef>,
    /// Fraction of requests delayed, default 1.0
    #[serde(default)]
    pub delayprobability: Option<f64>,
    /// Delay to inject, default `1s`
    #[serde(default)]
    pub delaytime: Option<CompoundDuration>,
}

/// Parameters of `abort_requests` / `abort_responses`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AbortParams {
    /// Calling service; absent means every caller of `dest`
    #[serde(default, deserialize_with = "optional_service")]
    pub source: Option<ServiceRef>,
    /// Called service; absent means every callee of `source`
    #[serde(default, deserialize_with = "optional_service")]
    pub dest: Option<ServiceRef>,
    /// Fraction of requests aborted, default 1.0
    #[serde(default)]
    pub abortprobability: Option<f64>,
    /// Status returned, default -1 (connection reset)
    #[serde(default)]
    pub errorcode: Option<i32>,
}

/// Parameters of `partition_services`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PartitionParams {
    /// One side of the partition; `source -> dest` must be declared
    #[serde(default, deserialize_with = "optional_service")]
    pub source: Option<ServiceRef>,
    /// Other side of the partition
    #[serde(default, deserialize_with = "optional_service")]
    pub dest: Option<ServiceRef>,
    /// Abort probability for `source -> dest`, default 1.0
    #[serde(default)]
    pub srcprobability: Option<f64>,
    /// Abort probability for `dest -> source`, default 1.0
    #[serde(default)]
    pub dstprobability: Option<f64>,
    /// Status returned, default -1
    #[serde(default)]
    pub errorcode: Option<i32>,
}

/// Parameters of `crash_service`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CrashParams {
    /// Crashed service
    #[serde(default, deserialize_with = "optional_service")]
    pub dest: Option<ServiceRef>,
    /// Fraction of requests aborted, default 1.0
    #[serde(default)]
    pub abortprobability: Option<f64>,
    /// Status returned, default 0 (no response body)
    #[serde(default)]
    pub errorcode: Option<i32>,
}

/// Parameters of `overload_service`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OverloadParams {
    /// Restrict the overload to one caller
    #[serde(default, deserialize_with = "optional_service")]
    pub source: Option<ServiceRef>,
    /// Overloaded service
    #[serde(default, deserialize_with = "optional_service")]
    pub dest: Option<ServiceRef>,
    /// Fraction of requests delayed, default 0.5
    #[serde(default)]
    pub delayprobability: Option<f64>,
    /// Delay to inject, default `10s`
    #[serde(default)]
    pub delaytime: Option<CompoundDuration>,
    /// Fraction of requests aborted, default 0.5
    #[serde(default)]
    pub abortprobability: Option<f64>,
    /// Status returned, default 503
    #[serde(default)]
    pub errorcode: Option<i32>,
}

/// One declared failure scenario
#[derive(Debug, Clone, PartialEq)]
pub enum Scenario {
    /// `delay_requests`
    DelayRequests(DelayParams),
    /// `delay_responses`
    DelayResponses(DelayParams),
    /// `abort_requests`
    AbortRequests(AbortParams),
    /// `abort_responses`
    AbortResponses(AbortParams),
    /// `partition_services`
    PartitionServices(PartitionParams),
    /// `crash_service`
    CrashService(CrashParams),
    /// `overload_service`
    OverloadService(OverloadParams),
}

impl Scenario {
    /// Scenario name
    #[must_use]
    pub fn kind(&self) -> ScenarioKind {
        match self {
            Self::DelayRequests(_) => ScenarioKind::DelayRequests,
            Self::DelayResponses(_) => ScenarioKind::DelayResponses,
            Self::AbortRequests(_) => ScenarioKind::AbortRequests,
            Self::AbortResponses(_) => ScenarioKind::AbortResponses,
            Self::PartitionServices(_) => ScenarioKind::PartitionServices,
            Self::CrashService(_) => ScenarioKind::CrashService,
            Self::OverloadService(_) => ScenarioKind::OverloadService,
        }
    }

    /// Parse one `{"scenario": name, ...params}` entry
    ///
    /// # Errors
    /// [`ValidationError::UnknownScenario`] for an unsupported name,
    /// [`ValidationError::InvalidScenario`] for bad parameters.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut fields) = value else {
            return Err(invalid("<entry>", "scenario entry must be an object"));
        };
        let kind: ScenarioKind = match fields.remove("scenario") {
            Some(Value::String(name)) => name.parse()?,
            Some(other) => return Err(invalid("<entry>", format!("scenario name must be a string, got {other}"))),
            None => return Err(invalid("<entry>", "missing 'scenario' field")),
        };

        let scenario = match kind {
            ScenarioKind::DelayRequests => Self::DelayRequests(params(kind, fields)?),
            ScenarioKind::DelayResponses => Self::DelayResponses(params(kind, fields)?),
            ScenarioKind::AbortRequests => Self::AbortRequests(params(kind, fields)?),
            ScenarioKind::AbortResponses => Self::AbortResponses(params(kind, fields)?),
            ScenarioKind::PartitionServices => Self::PartitionServices(params(kind, fields)?),
            ScenarioKind::CrashService => Self::CrashService(params(kind, fields)?),
            ScenarioKind::OverloadService => Self::OverloadService(params(kind, fields)?),
        };
        scenario.validate()?;
        Ok(scenario)
    }

    /// Check value ranges and required endpoints
    ///
    /// # Errors
    /// [`ValidationError::InvalidScenario`] naming the offending parameter.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let kind = self.kind();
        match self {
            Self::DelayRequests(p) | Self::DelayResponses(p) => {
                require_endpoint(kind, p.source.as_ref(), p.dest.as_ref())?;
                check_probability(kind, "delayprobability", p.delayprobability)?;
                check_delay(kind, p.delaytime)
            }
            Self::AbortRequests(p) | Self::AbortResponses(p) => {
                require_endpoint(kind, p.source.as_ref(), p.dest.as_ref())?;
                check_probability(kind, "abortprobability", p.abortprobability)?;
                check_return_code(kind, p.errorcode)
            }
            Self::PartitionServices(p) => {
                if p.source.is_none() || p.dest.is_none() {
                    return Err(invalid(kind, "both 'source' and 'dest' are required"));
                }
                check_probability(kind, "srcprobability", p.srcprobability)?;
                check_probability(kind, "dstprobability", p.dstprobability)?;
                check_return_code(kind, p.errorcode)
            }
            Self::CrashService(p) => {
                if p.dest.is_none() {
                    return Err(invalid(kind, "'dest' is required"));
                }
                check_probability(kind, "abortprobability", p.abortprobability)?;
                check_return_code(kind, p.errorcode)
            }
            Self::OverloadService(p) => {
                if p.dest.is_none() {
                    return Err(invalid(kind, "'dest' is required"));
                }
                check_probability(kind, "delayprobability", p.delayprobability)?;
                check_probability(kind, "abortprobability", p.abortprobability)?;
                check_delay(kind, p.delaytime)?;
                check_return_code(kind, p.errorcode)
            }
        }
    }
}

/// A scenario document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioSet {
    /// Scenarios in declaration order
    pub gremlins: Vec<Scenario>,
}

impl ScenarioSet {
    /// Parse a `{"gremlins": [...]}` document
    ///
    /// # Errors
    /// The first scenario error in declaration order.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let entries = match value {
            Value::Object(mut doc) => match doc.remove("gremlins") {
                Some(Value::Array(entries)) => entries,
                Some(_) => return Err(invalid("<document>", "'gremlins' must be a list")),
                None => return Err(invalid("<document>", "missing 'gremlins' list")),
            },
            _ => return Err(invalid("<document>", "scenario document must be an object")),
        };
        let gremlins = entries
            .into_iter()
            .map(Scenario::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { gremlins })
    }

    /// Load a scenario document from a JSON or YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a scenario is invalid.
    pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let value: Value = load_document(path)?;
        Ok(Self::from_value(value)?)
    }

    /// Number of scenarios
    #[must_use]
    pub fn len(&self) -> usize {
        self.gremlins.len()
    }

    /// Whether the document declares no scenarios
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gremlins.is_empty()
    }
}

fn params<T: for<'de> Deserialize<'de>>(
    kind: ScenarioKind,
    fields: Map<String, Value>,
) -> Result<T, ValidationError> {
    serde_json::from_value(Value::Object(fields)).map_err(|e| invalid(kind, e))
}

fn optional_service<'de, D>(deserializer: D) -> Result<Option<ServiceRef>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

fn invalid(scenario: impl fmt::Display, reason: impl fmt::Display) -> ValidationError {
    ValidationError::InvalidScenario {
        scenario: scenario.to_string(),
        reason: reason.to_string(),
    }
}

fn require_endpoint(
    kind: ScenarioKind,
    source: Option<&ServiceRef>,
    dest: Option<&ServiceRef>,
) -> Result<(), ValidationError> {
    if source.is_none() && dest.is_none() {
        return Err(invalid(kind, "at least one of 'source' or 'dest' is required"));
    }
    Ok(())
}

fn check_probability(kind: ScenarioKind, field: &str, value: Option<f64>) -> Result<(), ValidationError> {
    match value {
        Some(p) if !(p > 0.0 && p <= 1.0) => Err(invalid(
            kind,
            format!("'{field}' must be in (0, 1], got {p}"),
        )),
        _ => Ok(()),
    }
}

fn check_delay(kind: ScenarioKind, value: Option<CompoundDuration>) -> Result<(), ValidationError> {
    match value {
        Some(d) if d.is_zero() => Err(invalid(kind, "'delaytime' must be greater than zero")),
        _ => Ok(()),
    }
}

fn check_return_code(kind: ScenarioKind, value: Option<i32>) -> Result<(), ValidationError> {
    match value {
        Some(code) if !matches!(code, -1 | 0 | 100..=599) => Err(invalid(
            kind,
            format!("'errorcode' must be -1, 0 or an HTTP status, got {code}"),
        )),
        _ => Ok(()),
    }
}
