use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::attributes::{coerce_string, is_truthy};
use crate::hashing::padded_version_string;

/// A targeting condition.
///
/// Conditions arrive as JSON objects (a MongoDB-like query language) and are compiled once, when
/// the payload is parsed, into a tree of [`ConditionNode`]s. Regular expressions and version
/// strings are prepared at that point, so evaluation doesn't allocate for them.
///
/// The original JSON is kept so the condition can be serialized back unchanged (e.g., into the
/// persistent payload cache).
#[derive(Debug, Clone)]
pub struct Condition {
    raw: Value,
    pub(crate) root: ConditionNode,
}

impl Condition {
    /// Compile a condition from its JSON representation.
    pub fn from_json(raw: Value) -> Condition {
        let root = ConditionNode::parse(&raw);
        Condition { raw, root }
    }

    /// The JSON this condition was compiled from.
    pub fn as_json(&self) -> &Value {
        &self.raw
    }

    /// An empty condition, which always passes.
    pub fn empty() -> Condition {
        Condition::from_json(Value::Object(Default::default()))
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl From<Value> for Condition {
    fn from(value: Value) -> Self {
        Condition::from_json(value)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Condition::from_json)
    }
}

/// A node of a compiled condition tree.
#[derive(Debug, Clone)]
pub(crate) enum ConditionNode {
    Or(Vec<ConditionNode>),
    Nor(Vec<ConditionNode>),
    And(Vec<ConditionNode>),
    Not(Box<ConditionNode>),
    /// Map of attribute path to the condition its value must satisfy. All must pass.
    Fields(Vec<(String, ConditionValue)>),
    /// Not a JSON object, or a combinator with a malformed argument. Never passes.
    Invalid,
}

impl ConditionNode {
    fn parse(value: &Value) -> ConditionNode {
        let Value::Object(map) = value else {
            log::warn!(target: "growthbook", "condition must be an object");
            return ConditionNode::Invalid;
        };

        // Every key must pass: combinators are ANDed with the field conditions next to them.
        let mut nodes = Vec::new();
        let mut fields = Vec::new();
        for (key, value) in map {
            match key.as_str() {
                "$or" => nodes.push(parse_list(value).map_or(ConditionNode::Invalid, ConditionNode::Or)),
                "$nor" => nodes.push(parse_list(value).map_or(ConditionNode::Invalid, ConditionNode::Nor)),
                "$and" => nodes.push(parse_list(value).map_or(ConditionNode::Invalid, ConditionNode::And)),
                "$not" => nodes.push(ConditionNode::Not(Box::new(ConditionNode::parse(value)))),
                _ => fields.push((key.clone(), ConditionValue::parse(value))),
            }
        }

        if nodes.is_empty() {
            return ConditionNode::Fields(fields);
        }
        if !fields.is_empty() {
            nodes.push(ConditionNode::Fields(fields));
        }
        if nodes.len() == 1 {
            return nodes.remove(0);
        }
        ConditionNode::And(nodes)
    }
}

fn parse_list(items: &Value) -> Option<Vec<ConditionNode>> {
    match items {
        Value::Array(items) => Some(items.iter().map(ConditionNode::parse).collect()),
        _ => None,
    }
}

/// What a single attribute value must satisfy.
#[derive(Debug, Clone)]
pub(crate) enum ConditionValue {
    /// Compared against the attribute by (coercing) equality.
    Literal(Value),
    /// An operator object: every operator must pass.
    Operators(Vec<Operator>),
}

impl ConditionValue {
    pub(crate) fn parse(value: &Value) -> ConditionValue {
        match value {
            Value::Object(map) if is_operator_object(map) => ConditionValue::Operators(
                map.iter()
                    .map(|(name, arg)| Operator::parse(name, arg))
                    .collect(),
            ),
            other => ConditionValue::Literal(other.clone()),
        }
    }
}

/// An object is an operator object when it is non-empty and every key starts with `$`.
pub(crate) fn is_operator_object(map: &serde_json::Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|key| key.starts_with('$'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparison {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A compiled operator with its argument.
#[derive(Debug, Clone)]
pub(crate) enum Operator {
    Compare(Comparison, Value),
    /// Version comparison against a pre-padded version string.
    Version(Comparison, String),
    /// `$in`/`$ini`. `None` when the argument is not an array.
    In {
        values: Option<Vec<Value>>,
        case_insensitive: bool,
    },
    Nin {
        values: Option<Vec<Value>>,
        case_insensitive: bool,
    },
    All(Option<Vec<ConditionValue>>),
    Alli(Option<Vec<Value>>),
    InGroup(String),
    NotInGroup(String),
    Exists(bool),
    Type(String),
    /// `None` when the pattern failed to compile.
    Regex {
        regex: Option<Regex>,
        negate: bool,
    },
    Not(Box<ConditionValue>),
    Size(Box<ConditionValue>),
    ElemMatch(ElemMatch),
    Unknown(String),
}

#[derive(Debug, Clone)]
pub(crate) enum ElemMatch {
    /// Elements are matched as values (`{"$gt": 10}`).
    Value(ConditionValue),
    /// Elements are matched as objects (`{"name": "x"}`).
    Condition(ConditionNode),
}

impl Operator {
    fn parse(name: &str, arg: &Value) -> Operator {
        match name {
            "$eq" => Operator::Compare(Comparison::Eq, arg.clone()),
            "$ne" => Operator::Compare(Comparison::Ne, arg.clone()),
            "$lt" => Operator::Compare(Comparison::Lt, arg.clone()),
            "$lte" => Operator::Compare(Comparison::Lte, arg.clone()),
            "$gt" => Operator::Compare(Comparison::Gt, arg.clone()),
            "$gte" => Operator::Compare(Comparison::Gte, arg.clone()),

            "$veq" => Operator::Version(Comparison::Eq, padded_version_string(arg)),
            "$vne" => Operator::Version(Comparison::Ne, padded_version_string(arg)),
            "$vlt" => Operator::Version(Comparison::Lt, padded_version_string(arg)),
            "$vlte" => Operator::Version(Comparison::Lte, padded_version_string(arg)),
            "$vgt" => Operator::Version(Comparison::Gt, padded_version_string(arg)),
            "$vgte" => Operator::Version(Comparison::Gte, padded_version_string(arg)),

            "$in" | "$ini" => Operator::In {
                values: arg.as_array().cloned(),
                case_insensitive: name == "$ini",
            },
            "$nin" | "$nini" => Operator::Nin {
                values: arg.as_array().cloned(),
                case_insensitive: name == "$nini",
            },
            "$all" => Operator::All(
                arg.as_array()
                    .map(|items| items.iter().map(ConditionValue::parse).collect()),
            ),
            "$alli" => Operator::Alli(arg.as_array().cloned()),

            "$inGroup" => Operator::InGroup(coerce_string(Some(arg))),
            "$notInGroup" => Operator::NotInGroup(coerce_string(Some(arg))),

            "$exists" => Operator::Exists(is_truthy(Some(arg))),
            "$type" => Operator::Type(coerce_string(Some(arg))),

            "$regex" | "$regexi" | "$notRegex" | "$notRegexi" => {
                let case_insensitive = name.ends_with('i');
                let regex = arg.as_str().and_then(|pattern| {
                    RegexBuilder::new(pattern)
                        .case_insensitive(case_insensitive)
                        .build()
                        .inspect_err(|err| {
                            log::debug!(target: "growthbook", pattern; "invalid regex in condition: {err}");
                        })
                        .ok()
                });
                Operator::Regex {
                    regex,
                    negate: name.starts_with("$not"),
                }
            }

            "$not" => Operator::Not(Box::new(ConditionValue::parse(arg))),
            "$size" => Operator::Size(Box::new(ConditionValue::parse(arg))),
            "$elemMatch" => Operator::ElemMatch(match arg {
                Value::Object(map) if is_operator_object(map) => {
                    ElemMatch::Value(ConditionValue::parse(arg))
                }
                _ => ElemMatch::Condition(ConditionNode::parse(arg)),
            }),

            unknown => Operator::Unknown(unknown.to_owned()),
        }
    }
}
