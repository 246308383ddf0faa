//! Version routing and gradual traffic shifting
//!
//! The control plane stores per-service routing as a default version plus a
//! selector string such as `{v2={weight=0.25}}`. [`VersionSelector`] is the
//! typed form of one entry, written `v2(weight=0.25)` for humans.

use crate::error::{GremlinError, ValidationError};
use crate::transport::{RoutingControl, ServiceRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Version reported for instances without version metadata
pub const NO_VERSION: &str = "UNVERSIONED";

/// Percentage points added by a traffic step without an explicit amount
pub const DEFAULT_TRAFFIC_STEP: u32 = 10;

/// One routing selector: a version and the rule sending traffic to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSelector {
    version: String,
    rule: String,
}

impl VersionSelector {
    /// Selector with an arbitrary rule body
    ///
    /// # Errors
    /// [`ValidationError::InvalidSelector`] for an empty version or rule, a
    /// version containing selector punctuation, or a rule with unbalanced
    /// braces.
    pub fn new(version: impl Into<String>, rule: impl Into<String>) -> Result<Self, ValidationError> {
        let version = version.into().trim().to_string();
        let rule = rule.into().trim().to_string();
        let input = format!("{version}({rule})");
        if version.is_empty() || rule.is_empty() {
            return Err(invalid_selector(&input, "version and rule must be non-empty"));
        }
        if version.contains(['{', '}', '(', ')', '=', ',']) {
            return Err(invalid_selector(&input, "version contains selector punctuation"));
        }
        // The wire form wraps the rule in braces, so its own must nest.
        if split_top_level(&rule).is_err() {
            return Err(invalid_selector(&input, "rule has unbalanced braces"));
        }
        Ok(Self { version, rule })
    }

    /// Selector sending `percent`% of traffic to `version`
    ///
    /// # Errors
    /// [`ValidationError::InvalidSelector`] for an unusable version name.
    pub fn weighted(version: impl Into<String>, percent: u32) -> Result<Self, ValidationError> {
        Self::new(version, format!("weight={}", f64::from(percent) / 100.0))
    }

    /// Target version
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Rule body, e.g. `weight=0.25`
    #[must_use]
    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// Traffic fraction when the rule is a plain weight
    #[must_use]
    pub fn weight(&self) -> Option<f64> {
        let (key, value) = self.rule.split_once('=')?;
        if key.trim() != "weight" {
            return None;
        }
        value.trim().parse().ok()
    }

    /// Wire form of one entry, `v2={weight=0.25}`
    #[must_use]
    pub fn to_wire(&self) -> String {
        format!("{}={{{}}}", self.version, self.rule)
    }

    /// Parse a whole wire selector list, `{v2={weight=0.25},v3={...}}`
    ///
    /// An empty string or `{}` is an empty list.
    ///
    /// # Errors
    /// [`ValidationError::InvalidSelector`] when braces do not balance or an
    /// entry is not `version={rule}`.
    pub fn parse_wire_list(input: &str) -> Result<Vec<Self>, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let body = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| invalid_selector(input, "selector list must be wrapped in braces"))?;

        split_top_level(body)
            .map_err(|reason| invalid_selector(input, reason))?
            .into_iter()
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| {
                let (version, rule) = entry
                    .split_once('=')
                    .ok_or_else(|| invalid_selector(input, "entry is not version={rule}"))?;
                let rule = rule
                    .trim()
                    .strip_prefix('{')
                    .and_then(|r| r.strip_suffix('}'))
                    .ok_or_else(|| invalid_selector(input, "rule must be wrapped in braces"))?;
                Self::new(version, rule)
            })
            .collect()
    }

    /// Wire form of a selector list
    #[must_use]
    pub fn format_wire_list(selectors: &[Self]) -> String {
        let entries: Vec<String> = selectors.iter().map(Self::to_wire).collect();
        format!("{{{}}}", entries.join(","))
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.version, self.rule)
    }
}

impl FromStr for VersionSelector {
    type Err = ValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let (version, rest) = trimmed
            .split_once('(')
            .ok_or_else(|| invalid_selector(input, "expected version(rule)"))?;
        let rule = rest
            .strip_suffix(')')
            .ok_or_else(|| invalid_selector(input, "missing closing parenthesis"))?;
        Self::new(version, rule)
    }
}

fn split_top_level(body: &str) -> Result<Vec<&str>, &'static str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.checked_sub(1).ok_or("unbalanced braces")?,
            ',' if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced braces");
    }
    parts.push(&body[start..]);
    Ok(parts)
}

fn invalid_selector(input: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidSelector {
        input: input.to_string(),
        reason: reason.into(),
    }
}

/// Routing of one service as stored by the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVersions {
    /// Version receiving unselected traffic
    #[serde(default)]
    pub default: Option<String>,
    /// Wire selector list
    #[serde(default)]
    pub selectors: Option<String>,
}

impl ServiceVersions {
    /// Default version, [`NO_VERSION`] when unset
    #[must_use]
    pub fn default_version(&self) -> &str {
        match self.default.as_deref() {
            Some(v) if !v.is_empty() => v,
            _ => NO_VERSION,
        }
    }

    /// Parsed selectors
    ///
    /// # Errors
    /// [`ValidationError::InvalidSelector`] if the stored string is malformed.
    pub fn selector_list(&self) -> Result<Vec<VersionSelector>, ValidationError> {
        self.selectors
            .as_deref()
            .map_or_else(|| Ok(Vec::new()), VersionSelector::parse_wire_list)
    }

    /// Whether traffic is currently split between versions
    #[must_use]
    pub fn is_split(&self) -> bool {
        self.selectors
            .as_deref()
            .is_some_and(|s| !matches!(s.trim(), "" | "{}"))
    }
}

/// Outcome of a traffic-shift decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficPlan {
    /// Routing to store
    pub versions: ServiceVersions,
    /// Version traffic moves away from
    pub from: String,
    /// Version traffic moves to
    pub to: String,
    /// Share of traffic on `to` afterwards
    pub percent: u32,
}

impl TrafficPlan {
    /// Whether `to` now receives all traffic
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.percent >= 100
    }
}

/// Begin moving `amount`% of traffic to `version`
///
/// # Errors
/// [`ValidationError::InvalidTrafficAmount`] above 100,
/// [`ValidationError::InvalidTrafficState`] when traffic is already split.
pub fn plan_traffic_start(
    service: &str,
    current: Option<&ServiceVersions>,
    version: &str,
    amount: u32,
) -> Result<TrafficPlan, ValidationError> {
    if amount > 100 {
        return Err(ValidationError::InvalidTrafficAmount(amount));
    }
    let mut versions = current.cloned().unwrap_or_default();
    if versions.is_split() {
        return Err(traffic_state(service, "traffic is already being split"));
    }
    let from = versions.default_version().to_string();
    if amount == 100 {
        versions.default = Some(version.to_string());
        versions.selectors = None;
    } else {
        let selector = VersionSelector::weighted(version, amount)?;
        versions.selectors = Some(VersionSelector::format_wire_list(&[selector]));
    }
    Ok(TrafficPlan {
        versions,
        from,
        to: version.to_string(),
        percent: amount,
    })
}

/// Move traffic further towards the version currently selected
///
/// Without `amount` the share grows by [`DEFAULT_TRAFFIC_STEP`] points.
/// Reaching 100% promotes the version to default and drops the selector.
///
/// # Errors
/// [`ValidationError::InvalidTrafficState`] unless exactly one weight
/// selector is installed, [`ValidationError::InvalidTrafficAmount`] above 100.
pub fn plan_traffic_step(
    service: &str,
    current: &ServiceVersions,
    amount: Option<u32>,
) -> Result<TrafficPlan, ValidationError> {
    let selectors = current.selector_list()?;
    let [selector] = selectors.as_slice() else {
        return Err(traffic_state(service, "expected exactly one version selector"));
    };
    let weight = selector
        .weight()
        .ok_or_else(|| traffic_state(service, "selector is not a weight rule"))?;

    let percent = match amount {
        Some(a) if a > 100 => return Err(ValidationError::InvalidTrafficAmount(a)),
        Some(a) => a,
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        None => (weight * 100.0).round().max(0.0) as u32 + DEFAULT_TRAFFIC_STEP,
    }
    .min(100);

    let mut versions = current.clone();
    if percent == 100 {
        versions.default = Some(selector.version().to_string());
        versions.selectors = None;
    } else {
        let next = VersionSelector::weighted(selector.version(), percent)?;
        versions.selectors = Some(VersionSelector::format_wire_list(&[next]));
    }
    Ok(TrafficPlan {
        from: current.default_version().to_string(),
        to: selector.version().to_string(),
        versions,
        percent,
    })
}

/// Send all traffic back to the default version
///
/// # Errors
/// [`ValidationError::InvalidTrafficState`] when traffic is not split.
pub fn plan_traffic_abort(service: &str, current: &ServiceVersions) -> Result<TrafficPlan, ValidationError> {
    if !current.is_split() {
        return Err(traffic_state(service, "traffic is not being split"));
    }
    let target = current
        .selector_list()?
        .first()
        .map(|s| s.version().to_string())
        .unwrap_or_default();
    let mut versions = current.clone();
    versions.selectors = None;
    Ok(TrafficPlan {
        from: target,
        to: current.default_version().to_string(),
        versions,
        percent: 100,
    })
}

fn traffic_state(service: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidTrafficState {
        service: service.to_string(),
        reason: reason.to_string(),
    }
}

/// Registry metadata of one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    /// Deployed version
    #[serde(default)]
    pub version: Option<String>,
}

/// One live instance as reported by the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Instance metadata
    #[serde(default)]
    pub metadata: Option<InstanceMetadata>,
}

impl ServiceInstance {
    /// Instance of a given version
    #[must_use]
    pub fn versioned(version: impl Into<String>) -> Self {
        Self {
            metadata: Some(InstanceMetadata {
                version: Some(version.into()),
            }),
        }
    }

    /// Deployed version, [`NO_VERSION`] when unreported
    #[must_use]
    pub fn version(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|m| m.version.as_deref())
            .unwrap_or(NO_VERSION)
    }
}

/// Whether any instance runs `version`
#[must_use]
pub fn is_version_active(instances: &[ServiceInstance], version: &str) -> bool {
    instances.iter().any(|i| i.version() == version)
}

/// Instance count per version
#[must_use]
pub fn version_counts(instances: &[ServiceInstance]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for instance in instances {
        *counts.entry(instance.version().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Applies traffic plans against the control plane, checking liveness first
pub struct TrafficShifter {
    routing: Arc<dyn RoutingControl>,
    registry: Arc<dyn ServiceRegistry>,
}

impl TrafficShifter {
    /// Create a shifter
    #[must_use]
    pub fn new(routing: Arc<dyn RoutingControl>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self { routing, registry }
    }

    /// Start shifting `amount`% of `service` traffic to `version`
    ///
    /// Both the current default and the target version must have live
    /// instances.
    ///
    /// # Errors
    /// Validation errors from planning or liveness, transport errors from
    /// the control plane or registry.
    pub fn start(&self, service: &str, version: &str, amount: u32) -> Result<TrafficPlan, GremlinError> {
        let current = self.routing.get_versions(service)?;
        let plan = plan_traffic_start(service, current.as_ref(), version, amount)?;

        let instances = self.registry.instances(service)?;
        if !is_version_active(&instances, &plan.from) {
            return Err(traffic_state(service, "service is not currently receiving traffic").into());
        }
        if !is_version_active(&instances, version) {
            return Err(traffic_state(
                service,
                &format!("no active instances of version '{version}'"),
            )
            .into());
        }

        self.routing.set_versions(service, &plan.versions)?;
        tracing::info!(service, from = %plan.from, to = %plan.to, percent = plan.percent, "traffic shift started");
        Ok(plan)
    }

    /// Move more traffic to the selected version
    ///
    /// # Errors
    /// Validation errors from planning, transport errors from the control plane.
    pub fn step(&self, service: &str, amount: Option<u32>) -> Result<TrafficPlan, GremlinError> {
        let current = self
            .routing
            .get_versions(service)?
            .ok_or_else(|| traffic_state(service, "service has no routing"))?;
        let plan = plan_traffic_step(service, &current, amount)?;
        self.routing.set_versions(service, &plan.versions)?;
        tracing::info!(service, to = %plan.to, percent = plan.percent, "traffic shift stepped");
        Ok(plan)
    }

    /// Revert all traffic to the default version
    ///
    /// # Errors
    /// Validation errors from planning, transport errors from the control plane.
    pub fn abort(&self, service: &str) -> Result<TrafficPlan, GremlinError> {
        let current = self
            .routing
            .get_versions(service)?
            .ok_or_else(|| traffic_state(service, "service has no routing"))?;
        let plan = plan_traffic_abort(service, &current)?;
        self.routing.set_versions(service, &plan.versions)?;
        tracing::info!(service, to = %plan.to, "traffic shift aborted");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockRoutingControl, MockServiceRegistry};
    use proptest::prelude::*;

    fn split(selectors: &str) -> ServiceVersions {
        ServiceVersions {
            default: Some("v1".into()),
            selectors: Some(selectors.into()),
        }
    }

    #[test]
    fn parses_human_and_wire_forms() {
        let s: VersionSelector = "v2(weight=0.25)".parse().unwrap();
        assert_eq!(s.version(), "v2");
        assert_eq!(s.weight(), Some(0.25));
        assert_eq!(VersionSelector::format_wire_list(&[s.clone()]), "{v2={weight=0.25}}");
        assert_eq!(VersionSelector::parse_wire_list("{v2={weight=0.25}}").unwrap(), vec![s]);
    }

    #[test]
    fn parses_multi_entry_wire_lists() {
        let list = VersionSelector::parse_wire_list("{v2={weight=0.1},v3={header=x,y}}").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].rule(), "header=x,y");
        assert_eq!(list[1].weight(), None);
        assert!(VersionSelector::parse_wire_list("{}").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_selectors() {
        for bad in ["v2", "v2(weight=0.1", "(weight=1)", "v2()"] {
            assert!(bad.parse::<VersionSelector>().is_err(), "accepted {bad}");
        }
        for bad in ["v2={weight=0.1}", "{v2=weight}", "{v2={weight=0.1}", "{v2}"] {
            assert!(VersionSelector::parse_wire_list(bad).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn rule_braces_must_balance() {
        for rule in ["a}b", "{x", "}{"] {
            assert!(VersionSelector::new("v2", rule).is_err(), "accepted {rule}");
        }
        assert!("v2(weight=0.1})".parse::<VersionSelector>().is_err());

        let nested = VersionSelector::new("v3", "header={x-user,tester}").unwrap();
        let wire = VersionSelector::format_wire_list(&[nested.clone()]);
        assert_eq!(wire, "{v3={header={x-user,tester}}}");
        assert_eq!(VersionSelector::parse_wire_list(&wire).unwrap(), vec![nested]);
    }

    #[test]
    fn start_splits_or_promotes() {
        let plan = plan_traffic_start("reviews", None, "v2", 25).unwrap();
        assert_eq!(plan.from, NO_VERSION);
        assert_eq!(plan.versions.selectors.as_deref(), Some("{v2={weight=0.25}}"));

        let current = ServiceVersions {
            default: Some("v1".into()),
            selectors: None,
        };
        let plan = plan_traffic_start("reviews", Some(&current), "v2", 100).unwrap();
        assert!(plan.is_complete());
        assert_eq!(plan.versions.default.as_deref(), Some("v2"));
    }

    #[test]
    fn start_refuses_split_traffic_and_bad_amounts() {
        let current = split("{v2={weight=0.5}}");
        assert!(matches!(
            plan_traffic_start("reviews", Some(&current), "v3", 10),
            Err(ValidationError::InvalidTrafficState { .. })
        ));
        assert_eq!(
            plan_traffic_start("reviews", None, "v3", 101),
            Err(ValidationError::InvalidTrafficAmount(101))
        );
    }

    #[test]
    fn step_adds_ten_points_and_promotes_at_full() {
        let plan = plan_traffic_step("reviews", &split("{v2={weight=0.3}}"), None).unwrap();
        assert_eq!(plan.percent, 40);
        assert_eq!(plan.versions.selectors.as_deref(), Some("{v2={weight=0.4}}"));

        let plan = plan_traffic_step("reviews", &split("{v2={weight=0.95}}"), None).unwrap();
        assert!(plan.is_complete());
        assert_eq!(plan.versions.default.as_deref(), Some("v2"));
        assert_eq!(plan.versions.selectors, None);
    }

    #[test]
    fn step_requires_single_weight_selector() {
        assert!(plan_traffic_step("r", &split("{v2={weight=0.1},v3={weight=0.1}}"), None).is_err());
        assert!(plan_traffic_step("r", &split("{v2={header=x}}"), None).is_err());
        assert!(plan_traffic_step("r", &ServiceVersions::default(), None).is_err());
    }

    #[test]
    fn abort_clears_selectors() {
        let plan = plan_traffic_abort("reviews", &split("{v2={weight=0.3}}")).unwrap();
        assert_eq!(plan.to, "v1");
        assert_eq!(plan.from, "v2");
        assert_eq!(plan.versions.selectors, None);
        assert!(plan_traffic_abort("reviews", &ServiceVersions::default()).is_err());
    }

    #[test]
    fn liveness_uses_unversioned_fallback() {
        let instances = vec![ServiceInstance::default(), ServiceInstance::versioned("v2")];
        assert!(is_version_active(&instances, NO_VERSION));
        assert!(is_version_active(&instances, "v2"));
        assert!(!is_version_active(&instances, "v3"));
        assert_eq!(version_counts(&instances).get(NO_VERSION), Some(&1));
    }

    #[test]
    fn shifter_checks_liveness_before_writing() {
        let mut routing = MockRoutingControl::new();
        routing.expect_get_versions().returning(|_| Ok(None));
        routing.expect_set_versions().never();
        let mut registry = MockServiceRegistry::new();
        registry
            .expect_instances()
            .withf(|svc| svc == "reviews")
            .returning(|_| Ok(vec![ServiceInstance::default()]));

        let shifter = TrafficShifter::new(Arc::new(routing), Arc::new(registry));
        let err = shifter.start("reviews", "v2", 10).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn shifter_writes_planned_routing() {
        let mut routing = MockRoutingControl::new();
        routing.expect_get_versions().returning(|_| Ok(None));
        routing
            .expect_set_versions()
            .withf(|svc, v| svc == "reviews" && v.selectors.as_deref() == Some("{v2={weight=0.1}}"))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut registry = MockServiceRegistry::new();
        registry
            .expect_instances()
            .returning(|_| Ok(vec![ServiceInstance::default(), ServiceInstance::versioned("v2")]));

        let shifter = TrafficShifter::new(Arc::new(routing), Arc::new(registry));
        let plan = shifter.start("reviews", "v2", 10).unwrap();
        assert_eq!(plan.percent, 10);
    }

    proptest! {
        #[test]
        fn prop_selector_display_parse_roundtrip(version in "[a-z][a-z0-9]{0,6}", percent in 0u32..100) {
            let s = VersionSelector::weighted(version, percent).unwrap();
            let parsed: VersionSelector = s.to_string().parse().unwrap();
            prop_assert_eq!(&parsed, &s);
            let wire = VersionSelector::format_wire_list(&[s.clone()]);
            prop_assert_eq!(VersionSelector::parse_wire_list(&wire).unwrap(), vec![s]);
        }
    }
}
