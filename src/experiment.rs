//! Experiments and evaluation results.
use std::{fmt, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    payload::{BucketRange, Filter, Namespace, ParentCondition, VariationMeta},
    url_targeting::UrlTarget,
    Condition,
};

/// Predicate called right before bucketing. Returning `false` excludes the user.
pub type IncludeFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// An experiment with variations of type `T`.
///
/// Feature rules are turned into `Experiment<serde_json::Value>`. Standalone experiments can be
/// built in code with [`Experiment::new`] and run with any variation type.
///
/// # Examples
/// ```
/// # use growthbook::Experiment;
/// let mut experiment = Experiment::new("button-color", vec!["blue", "green"]);
/// experiment.weights = Some(vec![0.8, 0.2]);
/// ```
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment<T> {
    pub key: String,
    pub variations: Vec<T>,
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub status: Option<ExperimentStatus>,
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default)]
    pub ranges: Option<Vec<BucketRange>>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub parent_conditions: Option<Vec<ParentCondition>>,
    #[serde(skip)]
    pub include: Option<IncludeFn>,
    #[serde(default)]
    pub namespace: Option<Namespace>,
    /// Force every user into this variation, without tracking.
    #[serde(default)]
    pub force: Option<usize>,
    #[serde(default)]
    pub hash_attribute: Option<String>,
    #[serde(default)]
    pub fallback_attribute: Option<String>,
    #[serde(default)]
    pub hash_version: Option<u32>,
    #[serde(default)]
    pub disable_sticky_bucketing: bool,
    #[serde(default)]
    pub bucket_version: Option<u32>,
    #[serde(default)]
    pub min_bucket_version: Option<u32>,
    #[serde(default)]
    pub meta: Option<Vec<VariationMeta>>,
    #[serde(default)]
    pub filters: Option<Vec<Filter>>,
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    /// Legacy url targeting: a regular expression tested against the full url and the path.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub url_patterns: Option<Vec<UrlTarget>>,
    /// Only users in at least one of these groups are included.
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

impl<T> Experiment<T> {
    /// Create an experiment with default settings: equal weights, full coverage, hashed on `id`.
    pub fn new(key: impl Into<String>, variations: Vec<T>) -> Experiment<T> {
        Experiment {
            key: key.into(),
            variations,
            weights: None,
            active: None,
            status: None,
            coverage: None,
            ranges: None,
            condition: None,
            parent_conditions: None,
            include: None,
            namespace: None,
            force: None,
            hash_attribute: None,
            fallback_attribute: None,
            hash_version: None,
            disable_sticky_bucketing: false,
            bucket_version: None,
            min_bucket_version: None,
            meta: None,
            filters: None,
            seed: None,
            name: None,
            phase: None,
            url: None,
            url_patterns: None,
            groups: None,
        }
    }

    /// Apply an override on top of this experiment. Fields set in the override win.
    pub(crate) fn merge_override(&mut self, o: &ExperimentOverride) {
        if let Some(condition) = &o.condition {
            self.condition = Some(condition.clone());
        }
        if let Some(weights) = &o.weights {
            self.weights = Some(weights.clone());
        }
        if let Some(active) = o.active {
            self.active = Some(active);
        }
        if let Some(status) = o.status {
            self.status = Some(status);
        }
        if let Some(force) = o.force {
            self.force = Some(force);
        }
        if let Some(coverage) = o.coverage {
            self.coverage = Some(coverage);
        }
        if let Some(groups) = &o.groups {
            self.groups = Some(groups.clone());
        }
        if let Some(namespace) = &o.namespace {
            self.namespace = Some(namespace.clone());
        }
        if let Some(url) = &o.url {
            self.url = Some(url.clone());
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Experiment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("key", &self.key)
            .field("variations", &self.variations)
            .field("weights", &self.weights)
            .field("coverage", &self.coverage)
            .field("hash_attribute", &self.hash_attribute)
            .field("include", &self.include.as_ref().map(|_| "Fn"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Stopped,
}

/// Partial experiment settings applied by key on top of experiment definitions.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentOverride {
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub status: Option<ExperimentStatus>,
    #[serde(default)]
    pub force: Option<usize>,
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
    #[serde(default)]
    pub namespace: Option<Namespace>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Result of running an experiment.
///
/// Users that are not in the experiment still get a result: the baseline variation (index 0)
/// with `in_experiment == false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResult<T> {
    #[serde(default)]
    pub in_experiment: bool,
    #[serde(default)]
    pub variation_id: usize,
    pub value: T,
    /// Whether the hash was used to pick the variation (as opposed to being forced).
    #[serde(default)]
    pub hash_used: bool,
    #[serde(default)]
    pub hash_attribute: String,
    #[serde(default, deserialize_with = "deserialize_hash_value")]
    pub hash_value: String,
    #[serde(default)]
    pub feature_id: Option<String>,
    /// Variation key from `meta`, or the variation index as a string.
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw hash fraction in `[0, 1)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough: Option<bool>,
    #[serde(default)]
    pub sticky_bucket_used: bool,
}

/// Hash values are strings, but remote evaluation may send numeric ids.
fn deserialize_hash_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => crate::attributes::number_to_string(&n),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    })
}

/// Why a feature evaluated to its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureResultSource {
    UnknownFeature,
    DefaultValue,
    Force,
    Override,
    Experiment,
    Prerequisite,
    CyclicPrerequisite,
}

impl FeatureResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureResultSource::UnknownFeature => "unknownFeature",
            FeatureResultSource::DefaultValue => "defaultValue",
            FeatureResultSource::Force => "force",
            FeatureResultSource::Override => "override",
            FeatureResultSource::Experiment => "experiment",
            FeatureResultSource::Prerequisite => "prerequisite",
            FeatureResultSource::CyclicPrerequisite => "cyclicPrerequisite",
        }
    }
}

impl fmt::Display for FeatureResultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating a feature.
#[derive(Debug, Clone)]
pub struct FeatureResult {
    pub value: Value,
    pub on: bool,
    pub off: bool,
    pub source: FeatureResultSource,
    /// Id of the rule that produced the value, or an empty string.
    pub rule_id: String,
    pub experiment: Option<Experiment<Value>>,
    pub experiment_result: Option<ExperimentResult<Value>>,
}

impl FeatureResult {
    pub(crate) fn new(value: Value, source: FeatureResultSource, rule_id: Option<&str>) -> Self {
        let on = crate::attributes::is_truthy(Some(&value));
        FeatureResult {
            value,
            on,
            off: !on,
            source,
            rule_id: rule_id.unwrap_or_default().to_owned(),
            experiment: None,
            experiment_result: None,
        }
    }

    /// Deserialize the value into a concrete type. Returns `None` if the value doesn't fit.
    pub fn value_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        T::deserialize(&self.value).ok()
    }
}
