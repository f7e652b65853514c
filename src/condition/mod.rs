//! Targeting conditions: a small MongoDB-like query language over user attributes.
//!
//! A condition is a JSON object whose keys are either combinators (`$or`, `$nor`, `$and`,
//! `$not`) or dot-separated attribute paths. Each path maps to a literal (compared with
//! JavaScript-style coercion) or to an operator object such as `{"$gt": 10, "$lt": 20}`, where
//! every operator must pass.
//!
//! Evaluation is total: malformed conditions, invalid regular expressions, and unknown operators
//! evaluate to `false`.
mod eval;
mod models;

pub use models::Condition;

use crate::attributes::Attributes;
use crate::payload::SavedGroups;

/// Evaluate `condition` against `attributes`.
///
/// `$inGroup`/`$notInGroup` operators are resolved against `saved_groups`.
///
/// # Examples
/// ```
/// # use growthbook::{condition::{eval_condition, Condition}, Attributes, SavedGroups};
/// let condition = Condition::from_json(serde_json::json!({ "country": { "$in": ["US", "CA"] } }));
/// let mut attributes = Attributes::new();
/// attributes.insert("country".into(), "US".into());
/// assert!(eval_condition(&attributes, &condition, &SavedGroups::new()));
/// ```
pub fn eval_condition(
    attributes: &Attributes,
    condition: &Condition,
    saved_groups: &SavedGroups,
) -> bool {
    condition.eval(attributes, saved_groups)
}
