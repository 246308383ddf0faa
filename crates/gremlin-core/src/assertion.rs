//! Checklists, assertions and their results

use crate::duration::CompoundDuration;
use crate::error::ValidationError;
use crate::topology::load_document;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Supported assertion names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssertionKind {
    /// Every call answered within a latency bound
    BoundedResponseTime,
    /// Every call answered with an expected status
    HttpStatus,
    /// No trace sent more than N requests
    AtMostRequests,
    /// No request retried more than N times, optionally with fixed spacing
    BoundedRetries,
}

impl AssertionKind {
    /// All kinds
    pub const ALL: [Self; 4] = [
        Self::BoundedResponseTime,
        Self::HttpStatus,
        Self::AtMostRequests,
        Self::BoundedRetries,
    ];

    /// Name used in checklists
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BoundedResponseTime => "bounded_response_time",
            Self::HttpStatus => "http_status",
            Self::AtMostRequests => "at_most_requests",
            Self::BoundedRetries => "bounded_retries",
        }
    }
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssertionKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownAssertion(s.to_string()))
    }
}

/// Set of acceptable HTTP statuses; a single number or a list in documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany")]
pub struct StatusSet(BTreeSet<u16>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(u16),
    Many(Vec<u16>),
}

impl From<OneOrMany> for StatusSet {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(code) => Self(BTreeSet::from([code])),
            OneOrMany::Many(codes) => Self(codes.into_iter().collect()),
        }
    }
}

impl StatusSet {
    /// Whether `status` is acceptable
    #[must_use]
    pub fn contains(&self, status: u16) -> bool {
        self.0.contains(&status)
    }
}

impl<const N: usize> From<[u16; N]> for StatusSet {
    fn from(codes: [u16; N]) -> Self {
        Self(codes.into_iter().collect())
    }
}

/// Parameters of `bounded_response_time`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseTimeCheck {
    /// Calling service
    pub source: String,
    /// Called service
    pub dest: String,
    /// Largest acceptable upstream response time
    pub max_latency: CompoundDuration,
}

/// Parameters of `http_status`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusCheck {
    /// Calling service
    pub source: String,
    /// Called service
    pub dest: String,
    /// Acceptable statuses
    pub status: StatusSet,
}

/// Parameters of `at_most_requests`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestCountCheck {
    /// Calling service
    pub source: String,
    /// Called service
    pub dest: String,
    /// Largest acceptable number of requests per trace
    pub num_requests: u64,
}

/// Parameters of `bounded_retries`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryCheck {
    /// Calling service
    pub source: String,
    /// Called service
    pub dest: String,
    /// Largest acceptable number of retries per request
    pub retries: u64,
    /// Expected spacing between attempts
    #[serde(default)]
    pub wait_time: Option<CompoundDuration>,
    /// Tolerance on the spacing, in seconds
    #[serde(default)]
    pub errdelta: Option<f64>,
    /// Group attempts by URI instead of request id
    #[serde(default)]
    pub by_uri: bool,
}

/// A parsed assertion predicate with typed parameters
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    /// `bounded_response_time`
    BoundedResponseTime(ResponseTimeCheck),
    /// `http_status`
    HttpStatus(StatusCheck),
    /// `at_most_requests`
    AtMostRequests(RequestCountCheck),
    /// `bounded_retries`
    BoundedRetries(RetryCheck),
}

impl Check {
    /// Predicate name
    #[must_use]
    pub fn kind(&self) -> AssertionKind {
        match self {
            Self::BoundedResponseTime(_) => AssertionKind::BoundedResponseTime,
            Self::HttpStatus(_) => AssertionKind::HttpStatus,
            Self::AtMostRequests(_) => AssertionKind::AtMostRequests,
            Self::BoundedRetries(_) => AssertionKind::BoundedRetries,
        }
    }

    /// (source, dest) the predicate is about
    #[must_use]
    pub fn edge(&self) -> (&str, &str) {
        match self {
            Self::BoundedResponseTime(c) => (&c.source, &c.dest),
            Self::HttpStatus(c) => (&c.source, &c.dest),
            Self::AtMostRequests(c) => (&c.source, &c.dest),
            Self::BoundedRetries(c) => (&c.source, &c.dest),
        }
    }
}

/// One checklist entry: a predicate plus the parameters it was declared with
#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    check: Check,
    parameters: Map<String, Value>,
}

impl Assertion {
    /// Parse one `{"name": ..., ...params}` entry
    ///
    /// # Errors
    /// [`ValidationError::UnknownAssertion`] for an unsupported name,
    /// [`ValidationError::InvalidAssertion`] for bad parameters.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut parameters) = value else {
            return Err(invalid("<entry>", "assertion entry must be an object"));
        };
        let kind: AssertionKind = match parameters.remove("name") {
            Some(Value::String(name)) => name.parse()?,
            Some(other) => return Err(invalid("<entry>", format!("assertion name must be a string, got {other}"))),
            None => return Err(invalid("<entry>", "missing 'name' field")),
        };

        let fields = Value::Object(parameters.clone());
        let check = match kind {
            AssertionKind::BoundedResponseTime => Check::BoundedResponseTime(typed(kind, fields)?),
            AssertionKind::HttpStatus => Check::HttpStatus(typed(kind, fields)?),
            AssertionKind::AtMostRequests => Check::AtMostRequests(typed(kind, fields)?),
            AssertionKind::BoundedRetries => {
                let check: RetryCheck = typed(kind, fields)?;
                if check.errdelta.is_some_and(|d| !(d >= 0.0)) {
                    return Err(invalid(kind, "'errdelta' must be a non-negative number of seconds"));
                }
                Check::BoundedRetries(check)
            }
        };
        Ok(Self { check, parameters })
    }

    /// Build from a typed check; parameters are taken from `parameters`
    #[must_use]
    pub fn new(check: Check, parameters: Map<String, Value>) -> Self {
        Self { check, parameters }
    }

    /// Typed predicate
    #[inline]
    #[must_use]
    pub fn check(&self) -> &Check {
        &self.check
    }

    /// Predicate name
    #[inline]
    #[must_use]
    pub fn kind(&self) -> AssertionKind {
        self.check.kind()
    }

    /// Declared parameters, `name` excluded
    #[inline]
    #[must_use]
    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }
}

/// A list of assertions to evaluate against one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checklist {
    /// Assertions, in evaluation order
    pub checks: Vec<Assertion>,
    /// Log store override for this checklist
    pub log_server: Option<String>,
}

impl Checklist {
    /// Parse a `{"log_server"?: ..., "checks": [...]}` document
    ///
    /// # Errors
    /// The first assertion error in declaration order.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut doc) = value else {
            return Err(invalid("<document>", "checklist must be an object"));
        };
        let entries = match doc.remove("checks") {
            Some(Value::Array(entries)) => entries,
            Some(_) => return Err(invalid("<document>", "'checks' must be a list")),
            None => return Err(invalid("<document>", "missing 'checks' list")),
        };
        let log_server = match doc.remove("log_server") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(invalid("<document>", "'log_server' must be a string")),
        };
        let checks = entries
            .into_iter()
            .map(Assertion::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { checks, log_server })
    }

    /// Load a checklist from a JSON or YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or an assertion is invalid.
    pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let value: Value = load_document(path)?;
        Ok(Self::from_value(value)?)
    }
}

/// Outcome of one assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// Assertion name
    pub name: String,
    /// Calling service
    pub source: String,
    /// Called service
    pub dest: String,
    /// Declared parameters as JSON text
    pub parameters: String,
    /// Whether the assertion held
    pub success: bool,
    /// Why it failed; empty on success
    pub error_message: String,
}

impl AssertionResult {
    /// Result for `assertion` with the given verdict
    #[must_use]
    pub fn new(assertion: &Assertion, success: bool, error_message: impl Into<String>) -> Self {
        let (source, dest) = assertion.check().edge();
        Self {
            name: assertion.kind().to_string(),
            source: source.to_string(),
            dest: dest.to_string(),
            parameters: Value::Object(assertion.parameters().clone()).to_string(),
            success,
            error_message: error_message.into(),
        }
    }
}

fn typed<T: for<'de> Deserialize<'de>>(kind: AssertionKind, fields: Value) -> Result<T, ValidationError> {
    serde_json::from_value(fields).map_err(|e| invalid(kind, e))
}

fn invalid(name: impl fmt::Display, reason: impl fmt::Display) -> ValidationError {
    ValidationError::InvalidAssertion {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
