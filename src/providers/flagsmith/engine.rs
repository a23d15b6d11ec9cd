//! Local evaluation of Flagsmith environment documents.
//!
//! An identity's flags start from the environment's feature states, are overridden by the
//! segments the identity belongs to (lowest priority number wins) and finally by identity
//! overrides. Percentage splits and multivariate values need hashing and are not evaluated.

use std::collections::HashMap;

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    coerce,
    flag_store::{FlagSnapshot, RawFlag},
    Reason,
};

/// A Flagsmith environment document (the payload of the environment document endpoint).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentDocument {
    /// Environment feature states.
    #[serde(default)]
    pub feature_states: Vec<FeatureState>,
    /// Project, carrying the segment definitions.
    #[serde(default)]
    pub project: Project,
    /// Per-identity overrides.
    #[serde(default)]
    pub identity_overrides: Vec<IdentityOverride>,
}

/// The state of one feature: in an environment, a segment override or an API response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureState {
    /// The feature this state belongs to.
    pub feature: FeatureRef,
    /// Whether the feature is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// The feature's remote-config value.
    #[serde(default)]
    pub feature_state_value: Value,
    /// Segment override metadata.
    #[serde(default)]
    pub feature_segment: Option<FeatureSegment>,
}

/// Reference to a feature by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRef {
    /// Feature name, used as the flag key.
    pub name: String,
}

/// Segment override metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSegment {
    /// Lower values take precedence.
    #[serde(default)]
    pub priority: Option<i64>,
}

/// Project section of an environment document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    /// Segment definitions.
    #[serde(default)]
    pub segments: Vec<Segment>,
}

/// A segment: rules selecting identities and the overrides applied to them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Segment {
    /// Segment name.
    #[serde(default)]
    pub name: String,
    /// Rules; all must match.
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    /// Overrides for members of this segment.
    #[serde(default)]
    pub feature_states: Vec<FeatureState>,
}

/// Overrides for a single identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityOverride {
    /// The identity these overrides apply to.
    pub identifier: String,
    /// Overridden feature states.
    #[serde(default)]
    pub identity_features: Vec<FeatureState>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed value.
    Parsed(T),
    /// The raw value that could not be parsed.
    ParseFailed(Value),
}

/// How a rule combines its conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    /// Every condition matches.
    All,
    /// At least one condition matches.
    Any,
    /// No condition matches.
    None,
}

/// A segment rule with nested rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRule {
    /// How conditions combine.
    #[serde(rename = "type")]
    pub rule_type: TryParse<RuleType>,
    /// Conditions on traits.
    #[serde(default)]
    pub conditions: Vec<SegmentCondition>,
    /// Nested rules; all must match.
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
}

impl SegmentRule {
    /// Whether `traits` satisfy this rule. Rules with an unknown type never match.
    pub fn eval(&self, traits: &Map<String, Value>) -> bool {
        let TryParse::Parsed(rule_type) = self.rule_type else {
            return false;
        };
        let conditions_match = self.conditions.is_empty()
            || match rule_type {
                RuleType::All => self.conditions.iter().all(|c| c.eval(traits)),
                RuleType::Any => self.conditions.iter().any(|c| c.eval(traits)),
                RuleType::None => !self.conditions.iter().any(|c| c.eval(traits)),
            };
        conditions_match && self.rules.iter().all(|rule| rule.eval(traits))
    }
}

/// A condition on one trait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentCondition {
    /// Comparison operator.
    pub operator: TryParse<Operator>,
    /// Trait name.
    #[serde(default)]
    pub property_: Option<String>,
    /// Condition value, as configured in Flagsmith (usually a string).
    #[serde(default)]
    pub value: Option<Value>,
}

impl SegmentCondition {
    /// Whether `traits` satisfy this condition.
    pub fn eval(&self, traits: &Map<String, Value>) -> bool {
        let TryParse::Parsed(operator) = &self.operator else {
            log::debug!(target: "flagswitch", "unsupported Flagsmith condition operator");
            return false;
        };
        let trait_value = self
            .property_
            .as_deref()
            .and_then(|property| traits.get(property))
            .filter(|value| !value.is_null());
        let condition_value = self
            .value
            .as_ref()
            .map(|value| coerce::to_string(Some(value), ""))
            .unwrap_or_default();
        operator.eval(trait_value, &condition_value)
    }
}

/// Flagsmith segment condition operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    /// Equal to the value.
    Equal,
    /// Not equal to the value.
    NotEqual,
    /// Strictly greater.
    GreaterThan,
    /// Greater or equal.
    GreaterThanInclusive,
    /// Strictly less.
    LessThan,
    /// Less or equal.
    LessThanInclusive,
    /// The trait contains the value as a substring.
    Contains,
    /// The trait does not contain the value.
    NotContains,
    /// The trait is one of the comma-separated values.
    In,
    /// The trait matches the regular expression, anchored at the start.
    Regex,
    /// The trait is present.
    IsSet,
    /// The trait is absent.
    IsNotSet,
    /// `divisor|remainder`: the numeric trait modulo divisor equals remainder.
    Modulo,
    /// Hash-based split. Never matches locally.
    PercentageSplit,
}

const SEMVER_SUFFIX: &str = ":semver";

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    pub fn eval(&self, trait_value: Option<&Value>, condition_value: &str) -> bool {
        match self {
            Self::IsSet => trait_value.is_some(),
            Self::IsNotSet => trait_value.is_none(),
            _ => trait_value
                .and_then(|value| self.try_eval(value, condition_value))
                .unwrap_or(false),
        }
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(&self, trait_value: &Value, condition_value: &str) -> Option<bool> {
        match self {
            Self::IsSet | Self::IsNotSet => None,

            Self::PercentageSplit => {
                log::debug!(target: "flagswitch", "percentage split segments are not evaluated locally");
                None
            }

            Self::Modulo => {
                let (divisor, remainder) = condition_value.split_once('|')?;
                let divisor: f64 = divisor.trim().parse().ok()?;
                let remainder: f64 = remainder.trim().parse().ok()?;
                if divisor == 0.0 {
                    return None;
                }
                Some(trait_number(trait_value)? % divisor == remainder)
            }

            Self::In => {
                let s = trait_string(trait_value)?;
                Some(condition_value.split(',').any(|candidate| candidate.trim() == s))
            }

            Self::Regex => {
                let s = trait_string(trait_value)?;
                // Flagsmith matches patterns from the start of the value.
                let regex = Regex::new(&format!("^(?:{})", condition_value)).ok()?;
                Some(regex.is_match(&s))
            }

            Self::Contains | Self::NotContains => {
                let s = trait_string(trait_value)?;
                let contains = s.contains(condition_value);
                Some(if *self == Self::Contains {
                    contains
                } else {
                    !contains
                })
            }

            Self::Equal
            | Self::NotEqual
            | Self::GreaterThan
            | Self::GreaterThanInclusive
            | Self::LessThan
            | Self::LessThanInclusive => {
                if let Some(version) = condition_value.strip_suffix(SEMVER_SUFFIX) {
                    // semver comparison
                    let condition_version = Version::parse(version).ok()?;
                    let trait_version = Version::parse(trait_value.as_str()?).ok()?;
                    return self.compare(trait_version.cmp(&condition_version));
                }

                match trait_value {
                    Value::Bool(b) => {
                        let expected: bool = condition_value.trim().to_ascii_lowercase().parse().ok()?;
                        match self {
                            Self::Equal => Some(*b == expected),
                            Self::NotEqual => Some(*b != expected),
                            _ => None,
                        }
                    }
                    Value::Number(n) => {
                        let expected: f64 = condition_value.trim().parse().ok()?;
                        self.compare(n.as_f64()?.partial_cmp(&expected)?)
                    }
                    Value::String(s) => self.compare(s.as_str().cmp(condition_value)),
                    _ => None,
                }
            }
        }
    }

    fn compare(&self, ordering: std::cmp::Ordering) -> Option<bool> {
        use std::cmp::Ordering::*;
        Some(match self {
            Self::Equal => ordering == Equal,
            Self::NotEqual => ordering != Equal,
            Self::GreaterThan => ordering == Greater,
            Self::GreaterThanInclusive => ordering != Less,
            Self::LessThan => ordering == Less,
            Self::LessThanInclusive => ordering != Greater,
            _ => {
                // unreachable
                return None;
            }
        })
    }
}

fn trait_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(_) | Value::Bool(_) => Some(coerce::to_string(Some(value), "")),
        _ => None,
    }
}

fn trait_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Segment {
    /// An identity belongs to a segment if the segment has rules and all of them match.
    pub fn matches(&self, traits: &Map<String, Value>) -> bool {
        !self.rules.is_empty() && self.rules.iter().all(|rule| rule.eval(traits))
    }
}

impl EnvironmentDocument {
    /// Evaluate every feature for `identifier` with `traits`.
    pub(crate) fn identity_flags(&self, identifier: &str, traits: &Map<String, Value>) -> FlagSnapshot {
        let mut flags: HashMap<String, (RawFlag, Option<i64>)> = self
            .feature_states
            .iter()
            .map(|state| (state.feature.name.clone(), (raw_flag(state, Reason::Static), None)))
            .collect();

        for segment in self.project.segments.iter().filter(|s| s.matches(traits)) {
            log::trace!(target: "flagswitch", segment = segment.name.as_str(), identifier = identifier; "identity is in segment");
            for state in &segment.feature_states {
                let priority = state
                    .feature_segment
                    .as_ref()
                    .and_then(|fs| fs.priority)
                    .unwrap_or(i64::MAX);
                let takes_precedence = match flags.get(&state.feature.name) {
                    Some((_, Some(current))) => priority < *current,
                    _ => true,
                };
                if takes_precedence {
                    flags.insert(
                        state.feature.name.clone(),
                        (raw_flag(state, Reason::TargetingMatch), Some(priority)),
                    );
                }
            }
        }

        let mut snapshot: FlagSnapshot = flags
            .into_iter()
            .map(|(name, (flag, _))| (name, flag))
            .collect();

        for identity in self
            .identity_overrides
            .iter()
            .filter(|o| o.identifier == identifier)
        {
            for state in &identity.identity_features {
                snapshot.insert(
                    state.feature.name.clone(),
                    raw_flag(state, Reason::TargetingMatch),
                );
            }
        }

        snapshot
    }
}

pub(crate) fn raw_flag(state: &FeatureState, reason: Reason) -> RawFlag {
    RawFlag::new(state.feature_state_value.clone(), reason)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{EnvironmentDocument, Operator, SegmentRule};
    use crate::Reason;

    fn traits(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn equality_by_trait_type() {
        assert!(Operator::Equal.eval(Some(&json!("alice")), "alice"));
        assert!(!Operator::Equal.eval(Some(&json!("alice")), "bob"));
        assert!(Operator::Equal.eval(Some(&json!(42)), "42"));
        assert!(Operator::Equal.eval(Some(&json!(true)), "True"));
        assert!(Operator::NotEqual.eval(Some(&json!(false)), "true"));
        assert!(!Operator::Equal.eval(None, "alice"));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(Operator::GreaterThan.eval(Some(&json!(19)), "18"));
        assert!(!Operator::GreaterThan.eval(Some(&json!(18)), "18"));
        assert!(Operator::GreaterThanInclusive.eval(Some(&json!(18)), "18"));
        assert!(Operator::LessThan.eval(Some(&json!(17.5)), "18"));
        assert!(!Operator::LessThanInclusive.eval(Some(&json!(19)), "18"));
    }

    #[test]
    fn semver_comparisons() {
        assert!(Operator::GreaterThan.eval(Some(&json!("1.10.0")), "1.2.0:semver"));
        assert!(Operator::LessThanInclusive.eval(Some(&json!("1.0.0")), "1.0.0:semver"));
        assert!(!Operator::Equal.eval(Some(&json!("not-a-version")), "1.0.0:semver"));
    }

    #[test]
    fn string_operators() {
        assert!(Operator::Contains.eval(Some(&json!("alice@example.com")), "@example"));
        assert!(Operator::NotContains.eval(Some(&json!("alice@example.com")), "@test"));
        assert!(Operator::In.eval(Some(&json!("bob")), "alice, bob,carol"));
        assert!(Operator::In.eval(Some(&json!(7)), "5,7"));
        assert!(Operator::Regex.eval(Some(&json!("alice")), "al.*"));
        assert!(!Operator::Regex.eval(Some(&json!("malice")), "al.*"));
    }

    #[test]
    fn set_and_modulo() {
        assert!(Operator::IsSet.eval(Some(&json!("x")), ""));
        assert!(Operator::IsNotSet.eval(None, ""));
        assert!(Operator::Modulo.eval(Some(&json!(10)), "3|1"));
        assert!(!Operator::Modulo.eval(Some(&json!(10)), "0|0"));
        assert!(!Operator::PercentageSplit.eval(Some(&json!("alice")), "50"));
    }

    #[test]
    fn nested_rules() {
        let rule: SegmentRule = serde_json::from_value(json!({
            "type": "ALL",
            "conditions": [],
            "rules": [
                {"type": "ANY", "conditions": [
                    {"operator": "EQUAL", "property_": "userId", "value": "alice"},
                    {"operator": "EQUAL", "property_": "userId", "value": "bob"}
                ]},
                {"type": "NONE", "conditions": [
                    {"operator": "EQUAL", "property_": "plan", "value": "free"}
                ]}
            ]
        }))
        .unwrap();

        assert!(rule.eval(&traits(json!({"userId": "alice"}))));
        assert!(!rule.eval(&traits(json!({"userId": "bob", "plan": "free"}))));
        assert!(!rule.eval(&traits(json!({"userId": "carol"}))));
    }

    #[test]
    fn unknown_operator_does_not_fail_parsing() {
        let rule: SegmentRule = serde_json::from_value(json!({
            "type": "ALL",
            "conditions": [{"operator": "SOMETHING_NEW", "property_": "userId", "value": "alice"}]
        }))
        .unwrap();
        assert!(!rule.eval(&traits(json!({"userId": "alice"}))));
    }

    #[test]
    fn overrides_apply_in_order() {
        let document: EnvironmentDocument = serde_json::from_value(json!({
            "feature_states": [
                {"feature": {"name": "cta-color"}, "enabled": true, "feature_state_value": "blue"},
                {"feature": {"name": "new-badge"}, "enabled": true, "feature_state_value": false}
            ],
            "project": {"segments": [
                {
                    "name": "staff",
                    "rules": [{"type": "ALL", "conditions": [
                        {"operator": "CONTAINS", "property_": "userId", "value": "a"}
                    ]}],
                    "feature_states": [{
                        "feature": {"name": "cta-color"},
                        "enabled": true,
                        "feature_state_value": "purple",
                        "feature_segment": {"priority": 5}
                    }]
                },
                {
                    "name": "alice",
                    "rules": [{"type": "ALL", "conditions": [
                        {"operator": "EQUAL", "property_": "userId", "value": "alice"}
                    ]}],
                    "feature_states": [{
                        "feature": {"name": "cta-color"},
                        "enabled": true,
                        "feature_state_value": "green",
                        "feature_segment": {"priority": 1}
                    }]
                }
            ]},
            "identity_overrides": [{
                "identifier": "alice",
                "identity_features": [
                    {"feature": {"name": "new-badge"}, "enabled": true, "feature_state_value": true}
                ]
            }]
        }))
        .unwrap();

        let alice = document.identity_flags("alice", &traits(json!({"userId": "alice"})));
        assert_eq!(alice["cta-color"].value, json!("green"));
        assert_eq!(alice["cta-color"].reason, Reason::TargetingMatch);
        assert_eq!(alice["new-badge"].value, json!(true));

        let dave = document.identity_flags("dave", &traits(json!({"userId": "dave"})));
        assert_eq!(dave["cta-color"].value, json!("purple"));
        assert_eq!(dave["new-badge"].value, json!(false));

        let bob = document.identity_flags("bob", &traits(json!({"userId": "bob"})));
        assert_eq!(bob["cta-color"].value, json!("blue"));
        assert_eq!(bob["cta-color"].reason, Reason::Static);
    }
}
