use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use llmux_transform::compat::get_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    In,
    NotIn,
    Regex,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Dotted path into the route query payload, e.g. `payload.model`.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    /// How this condition combines with the accumulated result of the
    /// conditions before it.
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    /// Name of a registered predicate; only read for `custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Fixed,
    Weighted,
    RoundRobin,
    LeastConnections,
    Random,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTarget {
    /// Composite id of the pool entry this target routes to.
    pub composite_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub priority: i64,
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub strategy: StrategyKind,
    pub targets: Vec<RuleTarget>,
    /// Sticky-session lifetime in seconds for round-robin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_ttl_secs: Option<u64>,
}

/// What a request looks like to the rule engine.
#[derive(Debug, Clone)]
pub struct RouteQuery {
    /// `{"payload": {...}}` shaped document conditions index into.
    pub document: Value,
    pub session_id: Option<String>,
    /// Composite ids already tried by this request (failover exclusions).
    pub excluded: Vec<String>,
}

impl RouteQuery {
    pub fn new(document: Value) -> Self {
        Self {
            document,
            session_id: None,
            excluded: Vec::new(),
        }
    }
}

pub type CustomPredicate = Arc<dyn Fn(Option<&Value>, &Value) -> bool + Send + Sync>;

/// First-match evaluation: enabled rules, priority descending (stable for
/// equal priorities by insertion order), conditions folded left to right
/// with each condition's own logical operator.
pub fn evaluate_rules<'a>(
    rules: &'a [RoutingRule],
    query: &RouteQuery,
    custom: &HashMap<String, CustomPredicate>,
) -> Option<&'a RoutingRule> {
    let mut ordered: Vec<(usize, &RoutingRule)> = rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.enabled)
        .collect();
    ordered.sort_by(|(a_idx, a), (b_idx, b)| {
        b.priority.cmp(&a.priority).then(a_idx.cmp(b_idx))
    });

    ordered
        .into_iter()
        .map(|(_, rule)| rule)
        .find(|rule| rule_matches(rule, query, custom))
}

fn rule_matches(
    rule: &RoutingRule,
    query: &RouteQuery,
    custom: &HashMap<String, CustomPredicate>,
) -> bool {
    let mut iter = rule.conditions.iter();
    let Some(first) = iter.next() else {
        // A rule without conditions matches everything.
        return true;
    };
    let mut result = condition_matches(first, query, custom);
    for condition in iter {
        let outcome = condition_matches(condition, query, custom);
        result = match condition.logical_operator {
            LogicalOperator::And => result && outcome,
            LogicalOperator::Or => result || outcome,
        };
    }
    result
}

fn condition_matches(
    condition: &RuleCondition,
    query: &RouteQuery,
    custom: &HashMap<String, CustomPredicate>,
) -> bool {
    let actual = get_path(&query.document, &condition.field);
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Equals => actual == Some(expected),
        ConditionOperator::NotEquals => actual != Some(expected),
        ConditionOperator::Contains => match (actual.and_then(Value::as_str), expected.as_str()) {
            (Some(actual), Some(needle)) => actual.contains(needle),
            _ => actual
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(expected)),
        },
        ConditionOperator::NotContains => {
            !condition_matches(
                &RuleCondition {
                    operator: ConditionOperator::Contains,
                    ..condition.clone()
                },
                query,
                custom,
            )
        }
        ConditionOperator::StartsWith => string_pair(actual, expected)
            .is_some_and(|(actual, prefix)| actual.starts_with(prefix)),
        ConditionOperator::EndsWith => string_pair(actual, expected)
            .is_some_and(|(actual, suffix)| actual.ends_with(suffix)),
        ConditionOperator::GreaterThan => number_pair(actual, expected)
            .is_some_and(|(actual, bound)| actual > bound),
        ConditionOperator::LessThan => number_pair(actual, expected)
            .is_some_and(|(actual, bound)| actual < bound),
        ConditionOperator::GreaterOrEqual => number_pair(actual, expected)
            .is_some_and(|(actual, bound)| actual >= bound),
        ConditionOperator::LessOrEqual => number_pair(actual, expected)
            .is_some_and(|(actual, bound)| actual <= bound),
        ConditionOperator::In => expected
            .as_array()
            .zip(actual)
            .is_some_and(|(allowed, actual)| allowed.contains(actual)),
        ConditionOperator::NotIn => expected
            .as_array()
            .zip(actual)
            .is_some_and(|(denied, actual)| !denied.contains(actual)),
        ConditionOperator::Regex => match (actual.and_then(Value::as_str), expected.as_str()) {
            (Some(actual), Some(pattern)) => match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(actual),
                Err(err) => {
                    warn!(event = "rule_regex_invalid", pattern, error = %err);
                    false
                }
            },
            _ => false,
        },
        ConditionOperator::Custom => match condition
            .custom_name
            .as_deref()
            .and_then(|name| custom.get(name))
        {
            Some(predicate) => predicate(actual, expected),
            None => {
                warn!(
                    event = "rule_custom_predicate_missing",
                    name = condition.custom_name.as_deref().unwrap_or("")
                );
                false
            }
        },
    }
}

fn string_pair<'a>(actual: Option<&'a Value>, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((actual?.as_str()?, expected.as_str()?))
}

fn number_pair(actual: Option<&Value>, expected: &Value) -> Option<(f64, f64)> {
    Some((actual?.as_f64()?, expected.as_f64()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(model: &str) -> RouteQuery {
        RouteQuery::new(json!({"payload": {"model": model, "max_tokens": 16}}))
    }

    fn rule(id: &str, priority: i64, conditions: Vec<RuleCondition>) -> RoutingRule {
        RoutingRule {
            id: id.to_string(),
            priority,
            enabled: true,
            conditions,
            strategy: StrategyKind::Fixed,
            targets: vec![RuleTarget {
                composite_id: "p.m".to_string(),
                weight: None,
                fallback: false,
            }],
            session_ttl_secs: None,
        }
    }

    fn equals(field: &str, value: Value) -> RuleCondition {
        RuleCondition {
            field: field.to_string(),
            operator: ConditionOperator::Equals,
            value,
            logical_operator: LogicalOperator::And,
            custom_name: None,
        }
    }

    #[test]
    fn first_match_by_priority_then_insertion_order() {
        let rules = vec![
            rule("low", 10, vec![]),
            rule("high-b", 100, vec![]),
            rule("high-a", 100, vec![]),
        ];
        let matched = evaluate_rules(&rules, &query("m"), &HashMap::new()).unwrap();
        // Equal priority: the earlier-inserted rule wins.
        assert_eq!(matched.id, "high-b");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut disabled = rule("off", 100, vec![]);
        disabled.enabled = false;
        let rules = vec![disabled, rule("on", 1, vec![])];
        let matched = evaluate_rules(&rules, &query("m"), &HashMap::new()).unwrap();
        assert_eq!(matched.id, "on");
    }

    #[test]
    fn model_equals_condition_routes() {
        let rules = vec![rule(
            "claude",
            100,
            vec![equals("payload.model", json!("claude-router"))],
        )];
        assert!(evaluate_rules(&rules, &query("claude-router"), &HashMap::new()).is_some());
        assert!(evaluate_rules(&rules, &query("other"), &HashMap::new()).is_none());
    }

    #[test]
    fn or_combines_with_previous_result() {
        let conditions = vec![
            equals("payload.model", json!("a")),
            RuleCondition {
                logical_operator: LogicalOperator::Or,
                ..equals("payload.model", json!("b"))
            },
        ];
        let rules = vec![rule("either", 1, conditions)];
        assert!(evaluate_rules(&rules, &query("a"), &HashMap::new()).is_some());
        assert!(evaluate_rules(&rules, &query("b"), &HashMap::new()).is_some());
        assert!(evaluate_rules(&rules, &query("c"), &HashMap::new()).is_none());
    }

    #[test]
    fn comparison_and_set_operators() {
        let gt = RuleCondition {
            field: "payload.max_tokens".to_string(),
            operator: ConditionOperator::GreaterThan,
            value: json!(10),
            logical_operator: LogicalOperator::And,
            custom_name: None,
        };
        let within = RuleCondition {
            field: "payload.model".to_string(),
            operator: ConditionOperator::In,
            value: json!(["m", "n"]),
            logical_operator: LogicalOperator::And,
            custom_name: None,
        };
        let rules = vec![rule("both", 1, vec![gt, within])];
        assert!(evaluate_rules(&rules, &query("m"), &HashMap::new()).is_some());
        assert!(evaluate_rules(&rules, &query("x"), &HashMap::new()).is_none());
    }

    #[test]
    fn regex_and_prefix_operators() {
        let starts = RuleCondition {
            field: "payload.model".to_string(),
            operator: ConditionOperator::StartsWith,
            value: json!("claude-"),
            logical_operator: LogicalOperator::And,
            custom_name: None,
        };
        let pattern = RuleCondition {
            field: "payload.model".to_string(),
            operator: ConditionOperator::Regex,
            value: json!("^claude-[a-z]+$"),
            logical_operator: LogicalOperator::And,
            custom_name: None,
        };
        let rules = vec![rule("re", 1, vec![starts, pattern])];
        assert!(evaluate_rules(&rules, &query("claude-router"), &HashMap::new()).is_some());
        assert!(evaluate_rules(&rules, &query("claude-3"), &HashMap::new()).is_none());
    }

    #[test]
    fn custom_predicate_is_looked_up_by_name() {
        let condition = RuleCondition {
            field: "payload.model".to_string(),
            operator: ConditionOperator::Custom,
            value: json!(6),
            logical_operator: LogicalOperator::And,
            custom_name: Some("shorter_than".to_string()),
        };
        let rules = vec![rule("custom", 1, vec![condition])];
        let mut custom: HashMap<String, CustomPredicate> = HashMap::new();
        custom.insert(
            "shorter_than".to_string(),
            Arc::new(|actual, expected| {
                let Some(text) = actual.and_then(Value::as_str) else {
                    return false;
                };
                let Some(bound) = expected.as_u64() else {
                    return false;
                };
                (text.len() as u64) < bound
            }),
        );
        assert!(evaluate_rules(&rules, &query("short"), &custom).is_some());
        assert!(evaluate_rules(&rules, &query("very-long-model"), &custom).is_none());
        // Unknown predicate name never matches.
        assert!(evaluate_rules(&rules, &query("short"), &HashMap::new()).is_none());
    }
}
