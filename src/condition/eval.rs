use std::cmp::Ordering;

use serde_json::Value;

use crate::attributes::{coerce_number, coerce_string, is_truthy, AttributeSource};
use crate::hashing::padded_version_string;
use crate::payload::SavedGroups;

use super::models::{Comparison, Condition, ConditionNode, ConditionValue, ElemMatch, Operator};

impl Condition {
    /// Evaluate the condition against `obj`, resolving `$inGroup`/`$notInGroup` against
    /// `saved_groups`.
    ///
    /// Never fails: malformed conditions and unknown operators evaluate to `false`.
    pub(crate) fn eval<S: AttributeSource + ?Sized>(
        &self,
        obj: &S,
        saved_groups: &SavedGroups,
    ) -> bool {
        self.root.eval(obj, saved_groups)
    }
}

impl ConditionNode {
    fn eval<S: AttributeSource + ?Sized>(&self, obj: &S, saved_groups: &SavedGroups) -> bool {
        match self {
            ConditionNode::Or(items) => {
                items.is_empty() || items.iter().any(|item| item.eval(obj, saved_groups))
            }
            ConditionNode::Nor(items) => {
                !(items.is_empty() || items.iter().any(|item| item.eval(obj, saved_groups)))
            }
            ConditionNode::And(items) => items.iter().all(|item| item.eval(obj, saved_groups)),
            ConditionNode::Not(inner) => !inner.eval(obj, saved_groups),
            ConditionNode::Fields(fields) => fields
                .iter()
                .all(|(path, value)| value.eval(obj.lookup(path), saved_groups)),
            ConditionNode::Invalid => false,
        }
    }
}

impl ConditionValue {
    fn eval(&self, actual: Option<&Value>, saved_groups: &SavedGroups) -> bool {
        match self {
            ConditionValue::Literal(expected) => literal_matches(actual, expected),
            ConditionValue::Operators(operators) => operators
                .iter()
                .all(|operator| operator.eval(actual, saved_groups)),
        }
    }
}

fn literal_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match expected {
        Value::String(s) => coerce_string(actual) == *s,
        Value::Number(n) => n.as_f64().is_some_and(|n| coerce_number(actual) == n),
        Value::Bool(b) => {
            !matches!(actual, None | Some(Value::Null)) && is_truthy(actual) == *b
        }
        Value::Null => matches!(actual, None | Some(Value::Null)),
        Value::Array(_) | Value::Object(_) => actual.is_some_and(|actual| deep_equals(actual, expected)),
    }
}

impl Operator {
    fn eval(&self, actual: Option<&Value>, saved_groups: &SavedGroups) -> bool {
        match self {
            Operator::Compare(Comparison::Eq, expected) => strict_equals(actual, expected),
            Operator::Compare(Comparison::Ne, expected) => !strict_equals(actual, expected),
            Operator::Compare(cmp, expected) => {
                relational(actual, expected).is_some_and(|ordering| matches_ordering(*cmp, ordering))
            }

            Operator::Version(cmp, expected) => {
                let actual = padded_version_string(actual.unwrap_or(&Value::Null));
                matches_ordering(*cmp, actual.as_str().cmp(expected.as_str()))
            }

            Operator::In {
                values: Some(values),
                case_insensitive,
            } => is_in(actual, values, *case_insensitive),
            Operator::Nin {
                values: Some(values),
                case_insensitive,
            } => !is_in(actual, values, *case_insensitive),
            Operator::In { values: None, .. } | Operator::Nin { values: None, .. } => false,

            Operator::InGroup(group) => {
                is_in(actual, saved_group(saved_groups, group), false)
            }
            Operator::NotInGroup(group) => {
                !is_in(actual, saved_group(saved_groups, group), false)
            }

            Operator::All(Some(expected)) => {
                let Some(Value::Array(actual)) = actual else {
                    return false;
                };
                expected.iter().all(|condition| {
                    actual
                        .iter()
                        .any(|item| condition.eval(Some(item), saved_groups))
                })
            }
            Operator::Alli(Some(expected)) => {
                let Some(Value::Array(actual)) = actual else {
                    return false;
                };
                expected.iter().all(|expected| {
                    actual.iter().any(|item| values_equal(item, expected, true))
                })
            }
            Operator::All(None) | Operator::Alli(None) => false,

            Operator::Exists(expected) => {
                let exists = !matches!(actual, None | Some(Value::Null));
                exists == *expected
            }
            Operator::Type(expected) => type_of(actual) == expected,

            Operator::Regex { regex, negate } => {
                let Some(regex) = regex else {
                    return false;
                };
                let matched = match actual {
                    None | Some(Value::Null) => false,
                    Some(Value::String(s)) => regex.is_match(s),
                    Some(other) => regex.is_match(&coerce_string(Some(other))),
                };
                matched != *negate
            }

            Operator::Not(inner) => !inner.eval(actual, saved_groups),
            Operator::Size(expected) => {
                let Some(Value::Array(items)) = actual else {
                    return false;
                };
                expected.eval(Some(&Value::from(items.len())), saved_groups)
            }
            Operator::ElemMatch(expected) => {
                let Some(Value::Array(items)) = actual else {
                    return false;
                };
                items.iter().any(|item| {
                    is_truthy(Some(item))
                        && match expected {
                            ElemMatch::Value(condition) => condition.eval(Some(item), saved_groups),
                            ElemMatch::Condition(condition) => condition.eval(item, saved_groups),
                        }
                })
            }

            Operator::Unknown(operator) => {
                log::error!(target: "growthbook", operator = operator.as_str(); "unknown operator");
                false
            }
        }
    }
}

fn saved_group<'a>(saved_groups: &'a SavedGroups, group: &str) -> &'a [Value] {
    saved_groups.get(group).map_or(&[], Vec::as_slice)
}

/// Membership test. When the attribute is an array, any overlap counts.
fn is_in(actual: Option<&Value>, expected: &[Value], case_insensitive: bool) -> bool {
    let contains = |item: &Value| {
        expected
            .iter()
            .any(|candidate| values_equal(item, candidate, case_insensitive))
    };
    match actual {
        None => false,
        Some(Value::Array(items)) => items.iter().any(contains),
        Some(item) => contains(item),
    }
}

/// Equality of scalar values. Arrays and objects are never equal to anything (identity
/// semantics).
fn values_equal(a: &Value, b: &Value, case_insensitive: bool) -> bool {
    match (a, b) {
        (Value::String(a), Value::String(b)) if case_insensitive => {
            a.to_lowercase() == b.to_lowercase()
        }
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

fn strict_equals(actual: Option<&Value>, expected: &Value) -> bool {
    actual.is_some_and(|actual| values_equal(actual, expected, false))
}

/// Structural equality, with numbers compared by value (`1 == 1.0`).
fn deep_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| deep_equals(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, value)| b.get(key).is_some_and(|other| deep_equals(value, other)))
        }
        _ => values_equal(a, b, false),
    }
}

/// Ordering for `$lt`/`$lte`/`$gt`/`$gte`. Two strings compare lexically; anything else is
/// compared numerically. `None` when the values are not comparable (e.g., `NaN`).
fn relational(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Some(Value::String(a)), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (actual, expected) => coerce_number(actual).partial_cmp(&coerce_number(Some(expected))),
    }
}

fn matches_ordering(cmp: Comparison, ordering: Ordering) -> bool {
    match cmp {
        Comparison::Eq => ordering.is_eq(),
        Comparison::Ne => ordering.is_ne(),
        Comparison::Lt => ordering.is_lt(),
        Comparison::Lte => ordering.is_le(),
        Comparison::Gt => ordering.is_gt(),
        Comparison::Gte => ordering.is_ge(),
    }
}

fn type_of(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}
