use crate::{
    hashing::{hash, in_range},
    payload::{BucketRange, Filter},
};

use super::EvalContext;

/// A user is filtered out when, for any filter, their hash misses every range of the filter.
/// Users without a value for a filter's attribute are filtered out too.
pub(crate) fn is_filtered_out(ctx: &EvalContext<'_>, filters: &[Filter]) -> bool {
    filters.iter().any(|filter| {
        let (_, hash_value) = ctx.hash_attribute(filter.attribute.as_deref(), None);
        let Some(hash_value) = hash_value else {
            return true;
        };
        let Some(n) = hash(&filter.seed, &hash_value, filter.hash_version.unwrap_or(2)) else {
            return true;
        };
        !filter.ranges.iter().any(|range| in_range(n, range))
    })
}

/// Percentage rollout check for force rules.
#[allow(clippy::too_many_arguments)]
pub(crate) fn is_included_in_rollout(
    ctx: &EvalContext<'_>,
    seed: &str,
    hash_attribute: Option<&str>,
    fallback_attribute: Option<&str>,
    range: Option<&BucketRange>,
    coverage: Option<f64>,
    hash_version: Option<u32>,
) -> bool {
    if range.is_none() && coverage.is_none() {
        return true;
    }
    if range.is_none() && coverage == Some(0.0) {
        return false;
    }

    let (_, hash_value) = ctx.hash_attribute(hash_attribute, fallback_attribute);
    let Some(hash_value) = hash_value else {
        return false;
    };
    let Some(n) = hash(seed, &hash_value, hash_version.unwrap_or(1)) else {
        return false;
    };

    match (range, coverage) {
        (Some(range), _) => in_range(n, range),
        (None, Some(coverage)) => n <= coverage,
        (None, None) => true,
    }
}

/// Whether any of `groups` is enabled for the client.
pub(crate) fn has_group_overlap(ctx: &EvalContext<'_>, groups: &[String]) -> bool {
    groups
        .iter()
        .any(|group| ctx.options.groups.get(group).copied().unwrap_or(false))
}
