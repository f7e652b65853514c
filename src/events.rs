//! Side effects produced by evaluation.
//!
//! Evaluation functions don't call user callbacks or touch storage. They return events alongside
//! results, and the client adapters dispatch them (see [`tracking`](crate::tracking)).
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    experiment::{Experiment, ExperimentResult, FeatureResult},
    payload::TrackedExperiment,
    sticky_bucket::StickyAssignmentsDocument,
};

#[derive(Debug, Clone)]
pub enum EvalEvent {
    /// A user was bucketed into an experiment and should be reported to analytics.
    ExperimentViewed(ExperimentViewedEvent),
    /// A feature was evaluated.
    FeatureUsage {
        feature_key: String,
        result: FeatureResult,
    },
    /// A sticky bucket document changed and should be persisted.
    SaveStickyBucket(StickyAssignmentsDocument),
}

/// Experiment exposure, to be sent to your analytics tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentViewedEvent {
    pub experiment_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub variation_id: usize,
    pub variation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_name: Option<String>,
    pub hash_attribute: String,
    pub hash_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<f64>,
    pub sticky_bucket_used: bool,
}

impl ExperimentViewedEvent {
    pub(crate) fn new<T, R>(experiment: &Experiment<T>, result: &ExperimentResult<R>) -> Self {
        ExperimentViewedEvent {
            experiment_key: experiment.key.clone(),
            experiment_name: experiment.name.clone(),
            phase: experiment.phase.clone(),
            ..Self::from_result(result)
        }
    }

    pub(crate) fn from_track(experiment: &TrackedExperiment, result: &ExperimentResult<Value>) -> Self {
        ExperimentViewedEvent {
            experiment_key: experiment.key.clone(),
            experiment_name: experiment.name.clone(),
            phase: experiment.phase.clone(),
            ..Self::from_result(result)
        }
    }

    fn from_result<R>(result: &ExperimentResult<R>) -> Self {
        ExperimentViewedEvent {
            experiment_key: String::new(),
            experiment_name: None,
            phase: None,
            variation_id: result.variation_id,
            variation_key: result.key.clone(),
            variation_name: result.name.clone(),
            hash_attribute: result.hash_attribute.clone(),
            hash_value: result.hash_value.clone(),
            feature_id: result.feature_id.clone(),
            bucket: result.bucket,
            sticky_bucket_used: result.sticky_bucket_used,
        }
    }

    /// Identity of an exposure. Exposures with the same key are only reported once.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}{}{}{}",
            self.hash_attribute, self.hash_value, self.experiment_key, self.variation_id
        )
    }
}
