//! Fault rules as sent to the control plane, and the recipe that owns them

use crate::types::{RecipeId, ServiceRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Trace field that carries the recipe id in request logs
pub const TRACE_LOG_KEY: &str = "gremlin_recipe_id";

/// Priority given to generated rules; higher is evaluated first
pub const DEFAULT_RULE_PRIORITY: i32 = 10;

/// Requests a rule applies to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Calling service, absent for "any caller"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceMatch>,
    /// Header name → regex the header value must match
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Calling service selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMatch {
    /// Service name
    pub name: String,
    /// Version tags of the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl From<&ServiceRef> for SourceMatch {
    fn from(service: &ServiceRef) -> Self {
        Self {
            name: service.name().to_string(),
            tags: service.tag_list(),
        }
    }
}

/// What happens to a matching request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Hold the request for `duration` seconds
    Delay {
        /// Fraction of matching requests affected
        probability: f64,
        /// Delay in seconds
        duration: f64,
        /// Destination versions the action applies to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
    },
    /// Fail the request with `return_code` (-1 resets the connection)
    Abort {
        /// Fraction of matching requests affected
        probability: f64,
        /// HTTP status to return, -1 for reset, 0 for a bodiless close
        return_code: i32,
        /// Destination versions the action applies to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
    },
    /// Record `log_key = log_value` in the request log
    Trace {
        /// Log field name
        log_key: String,
        /// Log field value
        log_value: String,
        /// Destination versions the action applies to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
    },
}

impl Action {
    /// Whether this action only records, never disturbs, traffic
    #[inline]
    #[must_use]
    pub fn is_trace(&self) -> bool {
        matches!(self, Self::Trace { .. })
    }
}

/// One control-plane rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRule {
    /// Destination service name
    pub destination: String,
    /// Evaluation priority, higher first
    pub priority: i32,
    /// Rule tags; generated rules carry their recipe id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Request selector
    #[serde(rename = "match", default)]
    pub matcher: RuleMatch,
    /// Actions, in order
    pub actions: Vec<Action>,
}

impl FaultRule {
    /// Trace-only rule for `source -> dest`, tagged with the recipe
    #[must_use]
    pub fn passive(
        recipe: RecipeId,
        source: &ServiceRef,
        dest: &ServiceRef,
        headers: BTreeMap<String, String>,
        priority: i32,
    ) -> Self {
        Self {
            destination: dest.name().to_string(),
            priority,
            tags: vec![recipe.to_string()],
            matcher: RuleMatch {
                source: Some(SourceMatch::from(source)),
                headers,
            },
            actions: vec![Action::Trace {
                log_key: TRACE_LOG_KEY.to_string(),
                log_value: recipe.to_string(),
                tags: dest.tag_list(),
            }],
        }
    }

    /// Whether the rule only traces
    #[must_use]
    pub fn is_passive(&self) -> bool {
        self.actions.iter().all(Action::is_trace)
    }

    /// Calling service name, if the rule is scoped to one
    #[must_use]
    pub fn source_name(&self) -> Option<&str> {
        self.matcher.source.as_ref().map(|s| s.name.as_str())
    }
}

/// One fault-injection run: its rules and, once pushed, their remote ids
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    id: RecipeId,
    rules: Vec<FaultRule>,
    remote_rule_ids: Vec<String>,
}

impl Recipe {
    /// Empty recipe with a fresh id
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(RecipeId::new())
    }

    /// Empty recipe with a given id
    #[must_use]
    pub fn with_id(id: RecipeId) -> Self {
        Self {
            id,
            rules: Vec::new(),
            remote_rule_ids: Vec::new(),
        }
    }

    /// Recipe id
    #[inline]
    #[must_use]
    pub fn id(&self) -> RecipeId {
        self.id
    }

    /// Rules in push order
    #[inline]
    #[must_use]
    pub fn rules(&self) -> &[FaultRule] {
        &self.rules
    }

    /// Ids assigned by the control plane, aligned with [`Self::rules`]
    #[inline]
    #[must_use]
    pub fn remote_rule_ids(&self) -> &[String] {
        &self.remote_rule_ids
    }

    /// Whether the control plane currently holds rules for this recipe
    #[inline]
    #[must_use]
    pub fn is_installed(&self) -> bool {
        !self.remote_rule_ids.is_empty()
    }

    pub(crate) fn set_rules(&mut self, rules: Vec<FaultRule>) {
        self.rules = rules;
    }

    pub(crate) fn set_remote_rule_ids(&mut self, ids: Vec<String>) {
        self.remote_rule_ids = ids;
    }
}

impl Default for Recipe {
    fn default() -> Self {
        Self::new()
    }
}
