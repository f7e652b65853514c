use std::{
    borrow::Cow,
    panic::{catch_unwind, AssertUnwindSafe},
};

use serde_json::json;

use crate::{
    events::{EvalEvent, ExperimentViewedEvent},
    experiment::{Experiment, ExperimentResult, ExperimentStatus, FeatureResultSource, IncludeFn},
    hashing::{choose_variation, get_bucket_ranges, get_query_string_override, hash, in_namespace},
    sticky_bucket::{
        generate_sticky_bucket_assignment_doc, get_sticky_bucket_attribute_key,
        get_sticky_bucket_experiment_key, merged_assignments, sticky_bucket_variation,
        StickyAssignments, StickyBucketVariation,
    },
    url_targeting::{is_url_targeted, url_is_valid},
};

use super::{
    feature::evaluate_feature,
    rollout::{has_group_overlap, is_filtered_out},
    EvalContext,
};

/// Run an experiment for the user of `ctx`.
///
/// Never fails: users that can't be assigned get the baseline variation with
/// `in_experiment == false`. A tracking event is added to the context when the user is bucketed.
pub fn run_experiment<T: Clone + Default>(
    experiment: &Experiment<T>,
    ctx: &mut EvalContext<'_>,
) -> ExperimentResult<T> {
    ctx.reset_stack();
    run(experiment, None, ctx)
}

pub(crate) fn run<T: Clone + Default>(
    experiment: &Experiment<T>,
    feature_id: Option<&str>,
    ctx: &mut EvalContext<'_>,
) -> ExperimentResult<T> {
    let key = experiment.key.as_str();
    let num_variations = experiment.variations.len();

    let excluded = |ctx: &EvalContext<'_>, experiment: &Experiment<T>, reason: &str| {
        log::trace!(target: "growthbook", experiment_key = key, reason; "user is not in experiment");
        experiment_result(ctx, experiment, None, false, feature_id, None, false)
    };

    if num_variations < 2 {
        return excluded(ctx, experiment, "fewer than 2 variations");
    }
    if !ctx.options.enabled {
        return excluded(ctx, experiment, "client is disabled");
    }

    let experiment: Cow<'_, Experiment<T>> = match ctx.options.overrides.get(key) {
        Some(o) => {
            let mut experiment = experiment.clone();
            experiment.merge_override(o);
            Cow::Owned(experiment)
        }
        None => Cow::Borrowed(experiment),
    };
    let experiment = experiment.as_ref();

    if let Some(targets) = experiment.url_patterns.as_deref().filter(|t| !t.is_empty()) {
        if !is_url_targeted(ctx.url(), targets) {
            return excluded(ctx, experiment, "url is not targeted");
        }
    }

    if let Some(variation) = get_query_string_override(key, ctx.url(), num_variations) {
        log::trace!(target: "growthbook", experiment_key = key, variation; "variation forced by query string");
        return experiment_result(ctx, experiment, Some(variation), false, feature_id, None, false);
    }
    if let Some(variation) = ctx.forced_variation(key) {
        log::trace!(target: "growthbook", experiment_key = key, variation; "variation forced by context");
        return experiment_result(ctx, experiment, Some(variation), false, feature_id, None, false);
    }

    if experiment.status == Some(ExperimentStatus::Draft) || experiment.active == Some(false) {
        return excluded(ctx, experiment, "experiment is not active");
    }

    let sticky_enabled = ctx.sticky_bucketing_enabled() && !experiment.disable_sticky_bucketing;
    let fallback = sticky_enabled
        .then_some(experiment.fallback_attribute.as_deref())
        .flatten();
    let (hash_attribute, hash_value) =
        ctx.hash_attribute(experiment.hash_attribute.as_deref(), fallback);
    let Some(hash_value) = hash_value else {
        return excluded(ctx, experiment, "missing hash attribute");
    };

    let mut sticky = StickyBucketVariation::default();
    if sticky_enabled {
        sticky = sticky_bucket_variation(
            &sticky_assignments(ctx, experiment),
            key,
            experiment.bucket_version.unwrap_or(0),
            experiment.min_bucket_version.unwrap_or(0),
            experiment.meta.as_deref().unwrap_or_default(),
        );
    }
    let found_sticky_bucket = sticky.variation.is_some();

    if !found_sticky_bucket {
        if let Some(filters) = &experiment.filters {
            if is_filtered_out(ctx, filters) {
                return excluded(ctx, experiment, "filtered out");
            }
        } else if let Some(namespace) = &experiment.namespace {
            if !in_namespace(&hash_value, namespace) {
                return excluded(ctx, experiment, "not in namespace");
            }
        }

        if let Some(include) = &experiment.include {
            if !is_included(key, include) {
                return excluded(ctx, experiment, "include function returned false");
            }
        }

        if let Some(condition) = &experiment.condition {
            if !condition.eval(&ctx.user.attributes, ctx.saved_groups()) {
                return excluded(ctx, experiment, "condition failed");
            }
        }

        if let Some(parents) = &experiment.parent_conditions {
            let evaluated_features = ctx.evaluated_features.clone();
            for parent in parents {
                ctx.evaluated_features = evaluated_features.clone();
                let parent_result = evaluate_feature(&parent.id, ctx);
                if parent_result.source == FeatureResultSource::CyclicPrerequisite {
                    return excluded(ctx, experiment, "cyclic prerequisite");
                }
                let value = json!({ "value": parent_result.value });
                if !parent.condition.eval(&value, ctx.saved_groups()) {
                    return excluded(ctx, experiment, "prerequisite failed");
                }
            }
            ctx.evaluated_features = evaluated_features;
        }

        if let Some(groups) = &experiment.groups {
            if !has_group_overlap(ctx, groups) {
                return excluded(ctx, experiment, "no group overlap");
            }
        }
    }

    if let Some(url_regex) = &experiment.url {
        if !url_is_valid(url_regex, ctx.url()) {
            return excluded(ctx, experiment, "url does not match");
        }
    }

    let seed = experiment
        .seed
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(key);
    let Some(n) = hash(seed, &hash_value, experiment.hash_version.unwrap_or(1)) else {
        return excluded(ctx, experiment, "unsupported hash version");
    };

    let assigned = if found_sticky_bucket {
        sticky.variation
    } else {
        let ranges = match &experiment.ranges {
            Some(ranges) => Cow::Borrowed(ranges.as_slice()),
            None => Cow::Owned(get_bucket_ranges(
                num_variations,
                experiment.coverage.unwrap_or(1.0),
                experiment.weights.as_deref(),
            )),
        };
        choose_variation(n, &ranges)
    };

    if sticky.version_is_blocked {
        log::trace!(target: "growthbook", experiment_key = key; "sticky bucket version is blocked");
        return experiment_result(ctx, experiment, None, false, feature_id, None, true);
    }

    let Some(assigned) = assigned else {
        return excluded(ctx, experiment, "not covered");
    };

    if let Some(force) = experiment.force {
        return experiment_result(ctx, experiment, Some(force), false, feature_id, None, false);
    }
    if ctx.options.qa_mode {
        return excluded(ctx, experiment, "qa mode");
    }
    if experiment.status == Some(ExperimentStatus::Stopped) {
        return excluded(ctx, experiment, "experiment is stopped");
    }

    let result = experiment_result(
        ctx,
        experiment,
        Some(assigned),
        true,
        feature_id,
        Some(n),
        found_sticky_bucket,
    );

    if sticky_enabled {
        save_sticky_bucket(ctx, experiment, &hash_attribute, &hash_value, &result.key);
    }

    log::trace!(target: "growthbook",
                experiment_key = key,
                variation_id = result.variation_id,
                hash_value = result.hash_value.as_str();
                "user is in experiment");
    ctx.events
        .push(EvalEvent::ExperimentViewed(ExperimentViewedEvent::new(experiment, &result)));

    result
}

fn is_included(key: &str, include: &IncludeFn) -> bool {
    catch_unwind(AssertUnwindSafe(|| include())).unwrap_or_else(|_| {
        log::warn!(target: "growthbook", experiment_key = key; "include function panicked");
        false
    })
}

fn sticky_assignments<T>(ctx: &EvalContext<'_>, experiment: &Experiment<T>) -> StickyAssignments {
    let Some(docs) = ctx.sticky_docs.as_deref() else {
        return StickyAssignments::new();
    };

    let (attribute, value) = ctx.hash_attribute(experiment.hash_attribute.as_deref(), None);
    let hash_key = get_sticky_bucket_attribute_key(&attribute, value.as_deref().unwrap_or_default());

    // Without a fallback attribute this resolves to `id`, whose document is merged in as well.
    let (fallback, fallback_value) =
        ctx.hash_attribute(experiment.fallback_attribute.as_deref(), None);
    let fallback_key = fallback_value.map(|value| get_sticky_bucket_attribute_key(&fallback, &value));

    merged_assignments(docs, &hash_key, fallback_key.as_deref())
}

fn save_sticky_bucket<T>(
    ctx: &mut EvalContext<'_>,
    experiment: &Experiment<T>,
    hash_attribute: &str,
    hash_value: &str,
    variation_key: &str,
) {
    let Some(docs) = ctx.sticky_docs.as_mut() else {
        return;
    };
    let assignments = StickyAssignments::from([(
        get_sticky_bucket_experiment_key(&experiment.key, experiment.bucket_version.unwrap_or(0)),
        variation_key.to_owned(),
    )]);
    let (key, doc, changed) =
        generate_sticky_bucket_assignment_doc(docs, hash_attribute, hash_value, assignments);
    if changed {
        docs.to_mut().insert(key, doc.clone());
        ctx.events.push(EvalEvent::SaveStickyBucket(doc));
    }
}

/// Build a result for `variation`. Out-of-range (or no) variation yields the baseline with
/// `in_experiment == false`.
fn experiment_result<T: Clone + Default>(
    ctx: &EvalContext<'_>,
    experiment: &Experiment<T>,
    variation: Option<usize>,
    hash_used: bool,
    feature_id: Option<&str>,
    bucket: Option<f64>,
    sticky_bucket_used: bool,
) -> ExperimentResult<T> {
    let (variation_id, in_experiment) = match variation {
        Some(index) if index < experiment.variations.len() => (index, true),
        _ => (0, false),
    };

    let fallback = (ctx.sticky_bucketing_enabled() && !experiment.disable_sticky_bucketing)
        .then_some(experiment.fallback_attribute.as_deref())
        .flatten();
    let (hash_attribute, hash_value) =
        ctx.hash_attribute(experiment.hash_attribute.as_deref(), fallback);

    let meta = experiment
        .meta
        .as_ref()
        .and_then(|meta| meta.get(variation_id));

    ExperimentResult {
        in_experiment,
        variation_id,
        value: experiment
            .variations
            .get(variation_id)
            .cloned()
            .unwrap_or_default(),
        hash_used,
        hash_attribute,
        hash_value: hash_value.unwrap_or_default(),
        feature_id: feature_id.map(str::to_owned),
        key: meta
            .and_then(|m| m.key.clone())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| variation_id.to_string()),
        name: meta.and_then(|m| m.name.clone()).filter(|n| !n.is_empty()),
        bucket,
        passthrough: meta.and_then(|m| m.passthrough).filter(|p| *p),
        sticky_bucket_used,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use serde_json::{json, Value};

    use super::run_experiment;
    use crate::{
        eval::{EvalContext, EvalOptions, UserContext},
        events::EvalEvent,
        experiment::{Experiment, ExperimentStatus},
        payload::{Namespace, VariationMeta},
        sticky_bucket::{StickyAssignmentsDocument, StickyBucketDocs},
        Attributes, FeaturePayload,
    };

    fn user(attributes: Value) -> UserContext {
        UserContext::new(attributes.as_object().cloned().unwrap_or_else(Attributes::new))
    }

    fn run(experiment: &Experiment<i32>, user: &UserContext, options: &EvalOptions) -> (i32, bool, Vec<EvalEvent>) {
        let payload = FeaturePayload::default();
        let mut ctx = EvalContext::new(&payload, options, user);
        let result = run_experiment(experiment, &mut ctx);
        let (events, _) = ctx.into_parts();
        (result.value, result.in_experiment, events)
    }

    fn assignments(experiment: &Experiment<i32>, options: &EvalOptions) -> Vec<Option<i32>> {
        (1..=8)
            .map(|id| {
                let (value, in_experiment, _) =
                    run(experiment, &user(json!({ "id": id.to_string() })), options);
                in_experiment.then_some(value)
            })
            .collect()
    }

    #[test]
    fn assigns_variations_deterministically() {
        let experiment = Experiment::new("my-test", vec![0, 1]);
        assert_eq!(
            assignments(&experiment, &EvalOptions::default()),
            [1, 0, 0, 1, 1, 1, 0, 1].map(Some)
        );
    }

    #[test]
    fn coverage_excludes_users() {
        let mut experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.coverage = Some(0.5);
        assert_eq!(
            assignments(&experiment, &EvalOptions::default()),
            [None, Some(0), Some(0), None, Some(1), None, Some(0), Some(1)]
        );
    }

    #[test]
    fn hash_version_2() {
        let mut experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.hash_version = Some(2);
        // 0.1871, 0.1707, 0.8351, 0.103, 0.6103, 0.276, 0.3142, 0.2947
        assert_eq!(
            assignments(&experiment, &EvalOptions::default()),
            [0, 0, 1, 0, 1, 0, 0, 0].map(Some)
        );
    }

    #[test]
    fn namespaces_split_traffic() {
        let mut experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.namespace = Some(Namespace("ns1".to_owned(), 0.0, 0.4));
        let in_experiment: Vec<bool> = assignments(&experiment, &EvalOptions::default())
            .iter()
            .take(4)
            .map(Option::is_some)
            .collect();
        assert_eq!(in_experiment, [false, true, false, true]);
    }

    #[test]
    fn tracks_only_users_in_experiment() {
        let experiment = Experiment::new("my-test", vec![0, 1]);
        let (_, _, events) = run(&experiment, &user(json!({ "id": "1" })), &EvalOptions::default());
        assert!(matches!(
            events.as_slice(),
            [EvalEvent::ExperimentViewed(event)] if event.experiment_key == "my-test" && event.variation_id == 1
        ));

        let (_, in_experiment, events) = run(&experiment, &user(json!({})), &EvalOptions::default());
        assert!(!in_experiment);
        assert!(events.is_empty());
    }

    #[test]
    fn exclusion_pipeline() {
        let options = EvalOptions::default();
        let alice = user(json!({ "id": "1", "country": "US" }));

        let mut experiment = Experiment::new("my-test", vec![0]);
        assert!(!run(&experiment, &alice, &options).1);

        experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.active = Some(false);
        assert!(!run(&experiment, &alice, &options).1);

        experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.status = Some(ExperimentStatus::Draft);
        assert!(!run(&experiment, &alice, &options).1);

        experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.status = Some(ExperimentStatus::Stopped);
        assert!(!run(&experiment, &alice, &options).1);

        experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.condition = Some(json!({ "country": "CA" }).into());
        assert!(!run(&experiment, &alice, &options).1);

        experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.groups = Some(vec!["beta".to_owned()]);
        assert!(!run(&experiment, &alice, &options).1);
        let beta = EvalOptions {
            groups: HashMap::from([("beta".to_owned(), true)]),
            ..Default::default()
        };
        assert!(run(&experiment, &alice, &beta).1);

        experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.hash_attribute = Some("company".to_owned());
        assert!(!run(&experiment, &alice, &options).1);

        experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.hash_version = Some(99);
        assert!(!run(&experiment, &alice, &options).1);

        let disabled = EvalOptions {
            enabled: false,
            ..Default::default()
        };
        experiment = Experiment::new("my-test", vec![0, 1]);
        assert!(!run(&experiment, &alice, &disabled).1);
    }

    #[test]
    fn forced_variations_skip_tracking() {
        let experiment = Experiment::new("my-test", vec![0, 1]);
        let alice = user(json!({ "id": "1" }));

        let options = EvalOptions {
            forced_variations: HashMap::from([("my-test".to_owned(), 0)]),
            ..Default::default()
        };
        let (value, in_experiment, events) = run(&experiment, &alice, &options);
        assert_eq!((value, in_experiment), (0, true));
        assert!(events.is_empty());

        let from_url = alice.clone().with_url("https://example.com/?my-test=0");
        let (value, in_experiment, events) = run(&experiment, &from_url, &EvalOptions::default());
        assert_eq!((value, in_experiment), (0, true));
        assert!(events.is_empty());

        // experiment-level force applies only to users that are otherwise included
        let mut forced = Experiment::new("my-test", vec![0, 1]);
        forced.force = Some(0);
        let (value, _, events) = run(&forced, &alice, &EvalOptions::default());
        assert_eq!(value, 0);
        assert!(events.is_empty());

        let qa = EvalOptions {
            qa_mode: true,
            ..Default::default()
        };
        assert!(!run(&experiment, &alice, &qa).1);
    }

    #[test]
    fn include_function() {
        let alice = user(json!({ "id": "1" }));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut experiment = Experiment::new("my-test", vec![0, 1]);
        let counter = calls.clone();
        experiment.include = Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        }));
        assert!(!run(&experiment, &alice, &EvalOptions::default()).1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        experiment.include = Some(Arc::new(|| -> bool { panic!("boom") }));
        assert!(!run(&experiment, &alice, &EvalOptions::default()).1);
    }

    #[test]
    fn result_uses_variation_meta() {
        let mut experiment = Experiment::new("my-test", vec![0, 1]);
        experiment.meta = Some(vec![
            VariationMeta {
                key: Some("control".to_owned()),
                ..Default::default()
            },
            VariationMeta {
                key: Some("treatment".to_owned()),
                name: Some("Treatment".to_owned()),
                ..Default::default()
            },
        ]);
        let alice = user(json!({ "id": "1" }));
        let payload = FeaturePayload::default();
        let options = EvalOptions::default();
        let mut ctx = EvalContext::new(&payload, &options, &alice);

        let result = run_experiment(&experiment, &mut ctx);
        assert_eq!(result.variation_id, 1);
        assert_eq!(result.key, "treatment");
        assert_eq!(result.name.as_deref(), Some("Treatment"));
        assert_eq!(result.hash_attribute, "id");
        assert_eq!(result.hash_value, "1");
        assert_eq!(result.bucket, Some(0.969));
        assert!(result.hash_used);
    }

    fn sticky_experiment() -> Experiment<i32> {
        let mut experiment = Experiment::new("sticky-exp", vec![0, 1]);
        experiment.meta = Some(vec![
            VariationMeta {
                key: Some("control".to_owned()),
                ..Default::default()
            },
            VariationMeta {
                key: Some("treatment".to_owned()),
                ..Default::default()
            },
        ]);
        experiment
    }

    fn sticky_user(assignments: &[(&str, &str)]) -> UserContext {
        let mut user = user(json!({ "id": "1" }));
        let mut docs = StickyBucketDocs::new();
        if !assignments.is_empty() {
            docs.insert(
                "id||1".to_owned(),
                StickyAssignmentsDocument {
                    attribute_name: "id".to_owned(),
                    attribute_value: "1".to_owned(),
                    assignments: assignments
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                        .collect(),
                },
            );
        }
        user.sticky_bucket_assignment_docs = Some(docs);
        user
    }

    #[test]
    fn saves_sticky_bucket_assignment() {
        let experiment = sticky_experiment();
        let alice = sticky_user(&[("other__0", "x")]);
        let payload = FeaturePayload::default();
        let options = EvalOptions::default();
        let mut ctx = EvalContext::new(&payload, &options, &alice);

        // sticky-exp v1 hash for "1" is 0.441
        let result = run_experiment(&experiment, &mut ctx);
        assert_eq!(result.variation_id, 0);
        assert!(!result.sticky_bucket_used);

        let (events, docs) = ctx.into_parts();
        let saved = events.iter().find_map(|event| match event {
            EvalEvent::SaveStickyBucket(doc) => Some(doc),
            _ => None,
        });
        let saved = saved.expect("sticky bucket should be saved");
        assert_eq!(saved.assignments.get("sticky-exp__0").map(String::as_str), Some("control"));
        assert_eq!(saved.assignments.get("other__0").map(String::as_str), Some("x"));
        assert_eq!(docs.unwrap().get("id||1"), Some(saved));
    }

    #[test]
    fn uses_existing_sticky_bucket() {
        let mut experiment = sticky_experiment();
        // would normally exclude everyone
        experiment.coverage = Some(0.0);
        experiment.condition = Some(json!({ "country": "nowhere" }).into());
        let alice = sticky_user(&[("sticky-exp__0", "treatment")]);

        let payload = FeaturePayload::default();
        let options = EvalOptions::default();
        let mut ctx = EvalContext::new(&payload, &options, &alice);
        let result = run_experiment(&experiment, &mut ctx);

        assert!(result.in_experiment);
        assert_eq!(result.variation_id, 1);
        assert!(result.sticky_bucket_used);
        // unchanged document is not saved again
        assert!(!ctx
            .events()
            .iter()
            .any(|e| matches!(e, EvalEvent::SaveStickyBucket(_))));
    }

    #[test]
    fn blocked_sticky_bucket_version() {
        let mut experiment = sticky_experiment();
        experiment.bucket_version = Some(1);
        experiment.min_bucket_version = Some(1);
        let alice = sticky_user(&[("sticky-exp__0", "treatment")]);

        let payload = FeaturePayload::default();
        let options = EvalOptions::default();
        let mut ctx = EvalContext::new(&payload, &options, &alice);
        let result = run_experiment(&experiment, &mut ctx);

        assert!(!result.in_experiment);
        assert_eq!(result.variation_id, 0);
        assert!(result.sticky_bucket_used);
        assert!(ctx.events().is_empty());
    }
}
