//! Deterministic hashing and bucketing.
//!
//! Every GrowthBook SDK must produce identical bucket assignments for the same inputs, so the
//! functions in this module reproduce the reference algorithms bit-for-bit: FNV-1a over UTF-16
//! code units, the exact mixing order of each hash version, and cumulative range construction.
use serde_json::Value;

use crate::payload::{BucketRange, Namespace};

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the UTF-16 code units of `input`.
pub fn fnv1a_32(input: &str) -> u32 {
    input.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash `value` with `seed` into a number in `[0, 1)`.
///
/// - Version 1: `fnv(value + seed) % 1000 / 1000`.
/// - Version 2: `fnv(str(fnv(seed + value))) % 10000 / 10000`. The second pass removes the bias
///   version 1 shows for sequential inputs.
///
/// Returns `None` for unsupported versions. Callers must treat `None` as "cannot assign", never
/// as bucket zero.
pub fn hash(seed: &str, value: &str, version: u32) -> Option<f64> {
    match version {
        1 => {
            let h = fnv1a_32(&format!("{value}{seed}"));
            Some(f64::from(h % 1000) / 1000.0)
        }
        2 => {
            let inner = fnv1a_32(&format!("{seed}{value}"));
            let h = fnv1a_32(&inner.to_string());
            Some(f64::from(h % 10000) / 10000.0)
        }
        _ => None,
    }
}

/// Split traffic equally between `num_variations` variations.
pub fn get_equal_weights(num_variations: usize) -> Vec<f64> {
    if num_variations == 0 {
        return Vec::new();
    }
    vec![1.0 / num_variations as f64; num_variations]
}

/// Build the `[start, end)` range of every variation.
///
/// Each range starts at the cumulative weight of the preceding variations and spans
/// `coverage * weight`. Anchoring ranges at cumulative weights is what keeps assignments stable
/// when coverage shrinks: users are only ever excluded, never moved to another variation.
///
/// Invalid input falls back to safe defaults instead of failing: coverage is clamped to
/// `[0, 1]`, and weights that don't match the number of variations or don't sum to ~1 are
/// replaced with equal weights.
pub fn get_bucket_ranges(
    num_variations: usize,
    coverage: f64,
    weights: Option<&[f64]>,
) -> Vec<BucketRange> {
    let coverage = if coverage < 0.0 {
        log::debug!(target: "growthbook", coverage; "experiment coverage must be greater than or equal to 0");
        0.0
    } else if coverage > 1.0 {
        log::debug!(target: "growthbook", coverage; "experiment coverage must be less than or equal to 1");
        1.0
    } else {
        coverage
    };

    let equal = get_equal_weights(num_variations);
    let weights = match weights {
        Some(weights) if weights.len() != num_variations => {
            log::debug!(target: "growthbook", "weights array must be the same length as variations");
            equal
        }
        Some(weights) => {
            let total: f64 = weights.iter().sum();
            if !(0.99..=1.01).contains(&total) {
                log::debug!(target: "growthbook", total; "experiment weights must add up to 1");
                equal
            } else {
                weights.to_vec()
            }
        }
        None => equal,
    };

    let mut cumulative = 0.0;
    weights
        .into_iter()
        .map(|weight| {
            let start = cumulative;
            cumulative += weight;
            BucketRange(start, start + coverage * weight)
        })
        .collect()
}

/// Return `true` if `n` falls into the half-open `range`.
pub fn in_range(n: f64, range: &BucketRange) -> bool {
    n >= range.0 && n < range.1
}

/// Pick the first variation whose range contains `n`. `None` means the user is outside the
/// experiment's coverage.
pub fn choose_variation(n: f64, ranges: &[BucketRange]) -> Option<usize> {
    ranges.iter().position(|range| in_range(n, range))
}

/// Check whether `hash_value` falls into the namespace's slice of traffic.
///
/// Namespaces use their own hash keyed by the namespace name, so experiments sharing a
/// namespace get disjoint users without coupling their individual bucketing.
pub fn in_namespace(hash_value: &str, namespace: &Namespace) -> bool {
    let Some(n) = hash(&format!("__{}", namespace.0), hash_value, 1) else {
        return false;
    };
    n >= namespace.1 && n < namespace.2
}

/// Convert a version into a string that compares correctly with plain string comparison.
///
/// Build metadata and a leading `v` are dropped, numeric parts are left-padded to a fixed width
/// (so `"10"` sorts after `"9"`), and release versions get a trailing `~` so that `1.0.0` sorts
/// after any `1.0.0-<prerelease>`.
pub fn padded_version_string(input: &Value) -> String {
    let raw = match input {
        Value::Number(n) => crate::attributes::number_to_string(n),
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => "0".to_owned(),
    };
    padded_version(&raw)
}

pub(crate) fn padded_version(raw: &str) -> String {
    let without_prefix = raw.strip_prefix('v').unwrap_or(raw);
    let core = without_prefix
        .split_once('+')
        .map_or(without_prefix, |(core, _build)| core);

    let mut parts: Vec<&str> = core.split(['-', '.']).collect();
    if parts.len() == 3 {
        parts.push("~");
    }

    parts
        .into_iter()
        .map(|part| {
            if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
                format!("{part:>5}")
            } else {
                part.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Read a forced variation index for experiment `id` from the url's query string
/// (`?my-experiment=1`). Out-of-range or non-numeric values are ignored.
pub fn get_query_string_override(id: &str, url: &str, num_variations: usize) -> Option<usize> {
    let search = url.split('?').nth(1)?;
    if search.is_empty() {
        return None;
    }
    let search = search.split('#').next().unwrap_or_default();

    let value = search.split('&').find_map(|kv| {
        let mut parts = kv.splitn(3, '=');
        let key = parts.next()?;
        (key == id).then(|| parts.next())
    })?;

    let index = parse_leading_int(value?)?;
    usize::try_from(index)
        .ok()
        .filter(|&index| index < num_variations)
}

/// Parse the leading integer of a string, ignoring trailing garbage (`"1abc"` -> `1`).
fn parse_leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}
