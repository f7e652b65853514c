//! Wire models of the features payload served by the GrowthBook API and SSE stream.
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{experiment::ExperimentResult, Condition};

/// Saved group id to the list of member values (strings or numbers).
pub type SavedGroups = HashMap<String, Vec<Value>>;

/// Features payload. This is the response format of `GET /api/features/{clientKey}`, of the
/// remote evaluation endpoint, and the data of SSE `features` events.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturePayload {
    /// Feature definitions.
    ///
    /// Value is wrapped in `TryParse` so that if we fail to parse one feature (e.g., new server
    /// format), we can still serve other features.
    #[serde(default)]
    pub features: HashMap<String, TryParse<FeatureDefinition>>,
    /// Auto-experiments for the visual editor. Kept as-is and not executed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experiments: Vec<Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub saved_groups: SavedGroups,
    /// Opaque version token. Payloads with the same token are considered identical.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_features: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_experiments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_saved_groups: Option<String>,
}

impl FeaturePayload {
    /// Parse a payload from raw JSON.
    pub fn from_json(json: &[u8]) -> crate::Result<FeaturePayload> {
        let payload: FeaturePayload = serde_json::from_slice(json)?;
        payload.warn_if_encrypted();
        Ok(payload)
    }

    /// Find a feature definition. Returns `None` for unknown features and for features that
    /// failed to parse.
    pub fn get_feature(&self, key: &str) -> Option<&FeatureDefinition> {
        match self.features.get(key)? {
            TryParse::Parsed(feature) => Some(feature),
            TryParse::ParseFailed(_) => {
                log::warn!(target: "growthbook", feature_key = key; "feature definition failed to parse, treating as unknown");
                None
            }
        }
    }

    pub(crate) fn warn_if_encrypted(&self) {
        if self.encrypted_features.is_some() && self.features.is_empty() {
            log::warn!(target: "growthbook", "payload only carries encrypted features, which are not supported. Evaluating as an empty payload");
        }
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(Value),
}

impl<T> From<T> for TryParse<T> {
    fn from(value: T) -> TryParse<T> {
        TryParse::Parsed(value)
    }
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDefinition {
    #[serde(default)]
    pub default_value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<FeatureRule>,
}

/// A single rule of a feature.
///
/// A rule with `force` is a rollout rule. Otherwise a rule with `variations` is an experiment
/// rule. Rules with neither are skipped.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_conditions: Option<Vec<ParentCondition>>,
    /// Forced value. `Some(Value::Null)` is a valid force value, distinct from no `force` key.
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub force: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variations: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_version: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_sticky_bucketing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_bucket_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<BucketRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<BucketRange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Vec<VariationMeta>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Experiment views precomputed by remote evaluation, tracked when this rule is forced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<TrackData>>,
}

/// Distinguish an explicit `null` from a missing field.
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// A prerequisite: the value of feature `id` must satisfy `condition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentCondition {
    pub id: String,
    #[serde(default = "Condition::empty")]
    pub condition: Condition,
    /// A failing gate blocks the whole feature instead of skipping the rule.
    #[serde(default)]
    pub gate: bool,
}

/// Half-open `[start, end)` range of hash values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketRange(pub f64, pub f64);

/// Namespace `(name, start, end)`: the experiment only includes users whose namespace hash falls
/// into `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace(pub String, pub f64, pub f64);

/// Population filter. The user passes when their hash falls into any of `ranges`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub seed: String,
    pub ranges: Vec<BucketRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Passthrough variations fall through to the next rule as if the user was not assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough: Option<bool>,
}

/// A precomputed experiment view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackData {
    pub experiment: TrackedExperiment,
    pub result: ExperimentResult<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedExperiment {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{FeaturePayload, TryParse};

    #[test]
    fn parse_payload_fixture() {
        let payload = FeaturePayload::from_json(include_bytes!("../tests/data/features.json"))
            .expect("Failed to parse tests/data/features.json");

        assert!(payload.get_feature("feature").is_some());
        assert!(payload.get_feature("missing").is_none());
        assert_eq!(payload.date_updated.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(
            payload.saved_groups.get("beta-testers"),
            Some(&vec![json!("123"), json!(456)])
        );
    }

    #[test]
    fn one_bad_feature_does_not_break_others() {
        let payload = FeaturePayload::from_json(
            br#"{
                "features": {
                    "good": { "defaultValue": true },
                    "bad": { "defaultValue": 1, "rules": "not a list" }
                }
            }"#,
        )
        .unwrap();

        assert!(payload.get_feature("good").is_some());
        assert!(matches!(
            payload.features.get("bad"),
            Some(TryParse::ParseFailed(_))
        ));
        assert!(payload.get_feature("bad").is_none());
    }

    #[test]
    fn explicit_null_force_is_kept() {
        let payload = FeaturePayload::from_json(
            br#"{ "features": { "f": { "defaultValue": 1, "rules": [{ "force": null }, {}] } } }"#,
        )
        .unwrap();

        let feature = payload.get_feature("f").unwrap();
        assert_eq!(feature.rules[0].force, Some(Value::Null));
        assert_eq!(feature.rules[1].force, None);

        let serialized = serde_json::to_value(feature).unwrap();
        assert_eq!(serialized["rules"][0], json!({ "force": null }));
        assert_eq!(serialized["rules"][1], json!({}));
    }
}
