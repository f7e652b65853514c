//! User callbacks and the dispatcher that delivers evaluation events to them.
use std::{
    collections::{HashMap, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use crate::{
    events::{EvalEvent, ExperimentViewedEvent},
    experiment::FeatureResult,
    sticky_bucket::StickyBucketService,
};

/// Receives experiment exposures. Send them to your analytics tool.
///
/// Implemented for closures:
/// ```
/// # use growthbook::{ClientConfig, events::ExperimentViewedEvent};
/// let config = ClientConfig::new("sdk-abc123").tracking_callback(|event: ExperimentViewedEvent| {
///     println!("{} -> {}", event.experiment_key, event.variation_key);
/// });
/// ```
pub trait TrackingCallback {
    fn on_experiment_viewed(&self, event: ExperimentViewedEvent);
}

impl<T: Fn(ExperimentViewedEvent)> TrackingCallback for T {
    fn on_experiment_viewed(&self, event: ExperimentViewedEvent) {
        self(event);
    }
}

/// Receives feature evaluations.
pub trait FeatureUsageCallback {
    fn on_feature_usage(&self, feature_key: &str, result: &FeatureResult);
}

impl<T: Fn(&str, &FeatureResult)> FeatureUsageCallback for T {
    fn on_feature_usage(&self, feature_key: &str, result: &FeatureResult) {
        self(feature_key, result);
    }
}

/// What has already been reported for a user scope.
#[derive(Debug, Default)]
pub(crate) struct DedupState {
    tracked_experiments: Mutex<HashSet<String>>,
    /// (user scope, feature key) to the JSON of the last reported value.
    used_features: Mutex<HashMap<(String, String), String>>,
}

impl DedupState {
    /// Returns `true` the first time an exposure is seen.
    fn first_exposure(&self, event: &ExperimentViewedEvent) -> bool {
        self.tracked_experiments
            .lock()
            .expect("thread holding dedup lock should not panic")
            .insert(event.dedup_key())
    }

    /// Returns `true` when the feature value differs from the last one reported for `scope`.
    fn value_changed(&self, scope: &str, feature_key: &str, result: &FeatureResult) -> bool {
        let key = (scope.to_owned(), feature_key.to_owned());
        let value = result.value.to_string();
        let mut used = self
            .used_features
            .lock()
            .expect("thread holding dedup lock should not panic");
        if used.get(&key) == Some(&value) {
            return false;
        }
        used.insert(key, value);
        true
    }
}

/// Delivers evaluation events to user callbacks and the sticky bucket service.
///
/// Each callback is isolated: a panicking callback is logged and doesn't prevent delivery of
/// other events.
#[derive(Clone, Default)]
pub(crate) struct EventDispatcher {
    pub(crate) tracking_callback: Option<Arc<dyn TrackingCallback + Send + Sync>>,
    pub(crate) feature_usage_callback: Option<Arc<dyn FeatureUsageCallback + Send + Sync>>,
    pub(crate) sticky_bucket_service: Option<Arc<dyn StickyBucketService>>,
}

impl EventDispatcher {
    /// Feature usage is deduplicated per `usage_scope`, so a state shared across users should be
    /// given a distinct scope for each user.
    pub(crate) fn dispatch(&self, events: Vec<EvalEvent>, dedup: &DedupState, usage_scope: &str) {
        for event in events {
            match event {
                EvalEvent::ExperimentViewed(event) => {
                    let Some(callback) = &self.tracking_callback else {
                        continue;
                    };
                    if !dedup.first_exposure(&event) {
                        continue;
                    }
                    log::trace!(target: "growthbook", experiment_key = event.experiment_key.as_str(), variation_id = event.variation_id; "tracking experiment exposure");
                    let experiment_key = event.experiment_key.clone();
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        callback.on_experiment_viewed(event);
                    }));
                    if outcome.is_err() {
                        log::warn!(target: "growthbook", experiment_key = experiment_key.as_str(); "tracking callback panicked");
                    }
                }
                EvalEvent::FeatureUsage {
                    feature_key,
                    result,
                } => {
                    let Some(callback) = &self.feature_usage_callback else {
                        continue;
                    };
                    if !dedup.value_changed(usage_scope, &feature_key, &result) {
                        continue;
                    }
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        callback.on_feature_usage(&feature_key, &result);
                    }));
                    if outcome.is_err() {
                        log::warn!(target: "growthbook", feature_key = feature_key.as_str(); "feature usage callback panicked");
                    }
                }
                EvalEvent::SaveStickyBucket(doc) => {
                    let Some(service) = &self.sticky_bucket_service else {
                        continue;
                    };
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| service.save_assignments(&doc)));
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            log::warn!(target: "growthbook",
                                       attribute_name = doc.attribute_name.as_str();
                                       "failed to save sticky bucket assignments: {err}");
                        }
                        Err(_) => {
                            log::warn!(target: "growthbook",
                                       attribute_name = doc.attribute_name.as_str();
                                       "sticky bucket service panicked");
                        }
                    }
                }
            }
        }
    }
}
