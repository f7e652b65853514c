use serde_json::{json, Value};

use crate::{
    events::{EvalEvent, ExperimentViewedEvent},
    experiment::{Experiment, FeatureResult, FeatureResultSource},
    payload::FeatureRule,
};

use super::{
    experiment::run,
    rollout::{is_filtered_out, is_included_in_rollout},
    EvalContext,
};

/// Evaluate feature `id` for the user of `ctx`.
///
/// Rules are evaluated in order and the first matching rule wins. Evaluation never fails:
/// unknown features evaluate to `null`, prerequisite cycles are reported with
/// [`FeatureResultSource::CyclicPrerequisite`].
pub fn eval_feature(id: &str, ctx: &mut EvalContext<'_>) -> FeatureResult {
    ctx.reset_stack();
    evaluate_feature(id, ctx)
}

pub(crate) fn evaluate_feature(id: &str, ctx: &mut EvalContext<'_>) -> FeatureResult {
    if ctx.evaluated_features.contains(id) {
        log::error!(target: "growthbook", feature_key = id; "circular prerequisite detected");
        return feature_result(ctx, id, Value::Null, FeatureResultSource::CyclicPrerequisite, None);
    }
    ctx.evaluated_features.insert(id.to_owned());

    if let Some(value) = ctx.forced_feature(id) {
        log::trace!(target: "growthbook", feature_key = id; "feature value forced");
        return feature_result(ctx, id, value.clone(), FeatureResultSource::Override, None);
    }

    let payload = ctx.payload;
    let Some(feature) = payload.get_feature(id) else {
        log::trace!(target: "growthbook", feature_key = id; "unknown feature");
        return feature_result(ctx, id, Value::Null, FeatureResultSource::UnknownFeature, None);
    };

    let evaluated_features = ctx.evaluated_features.clone();

    'rules: for rule in &feature.rules {
        if let Some(parents) = &rule.parent_conditions {
            for parent in parents {
                ctx.evaluated_features = evaluated_features.clone();
                let parent_result = evaluate_feature(&parent.id, ctx);
                if parent_result.source == FeatureResultSource::CyclicPrerequisite {
                    return feature_result(
                        ctx,
                        id,
                        Value::Null,
                        FeatureResultSource::CyclicPrerequisite,
                        None,
                    );
                }

                let value = json!({ "value": parent_result.value });
                if !parent.condition.eval(&value, ctx.saved_groups()) {
                    if parent.gate {
                        log::trace!(target: "growthbook", feature_key = id, parent = parent.id.as_str(); "prerequisite gate failed");
                        return feature_result(
                            ctx,
                            id,
                            Value::Null,
                            FeatureResultSource::Prerequisite,
                            None,
                        );
                    }
                    continue 'rules;
                }
            }
        }

        if let Some(force) = &rule.force {
            if !force_rule_matches(ctx, id, rule) {
                continue;
            }

            for track in rule.tracks.iter().flatten() {
                ctx.events.push(EvalEvent::ExperimentViewed(
                    ExperimentViewedEvent::from_track(&track.experiment, &track.result),
                ));
            }

            log::trace!(target: "growthbook", feature_key = id, rule_id = rule.id.as_deref(); "feature value forced by rule");
            return feature_result(
                ctx,
                id,
                force.clone(),
                FeatureResultSource::Force,
                rule.id.as_deref(),
            );
        }

        let Some(variations) = &rule.variations else {
            continue;
        };

        let experiment = experiment_from_rule(id, rule, variations.clone());
        let result = run(&experiment, Some(id), ctx);
        if result.in_experiment && !result.passthrough.unwrap_or(false) {
            let mut feature_result_value = FeatureResult::new(
                result.value.clone(),
                FeatureResultSource::Experiment,
                rule.id.as_deref(),
            );
            feature_result_value.experiment = Some(experiment);
            feature_result_value.experiment_result = Some(result);
            return report_usage(ctx, id, feature_result_value);
        }
    }

    feature_result(
        ctx,
        id,
        feature.default_value.clone(),
        FeatureResultSource::DefaultValue,
        None,
    )
}

/// Filters, condition, and percentage rollout of a force rule.
fn force_rule_matches(ctx: &EvalContext<'_>, id: &str, rule: &FeatureRule) -> bool {
    if let Some(filters) = &rule.filters {
        if is_filtered_out(ctx, filters) {
            return false;
        }
    }

    if let Some(condition) = &rule.condition {
        if !condition.eval(&ctx.user.attributes, ctx.saved_groups()) {
            return false;
        }
    }

    let fallback = (ctx.sticky_bucketing_enabled() && !rule.disable_sticky_bucketing)
        .then_some(rule.fallback_attribute.as_deref())
        .flatten();
    is_included_in_rollout(
        ctx,
        rule.seed.as_deref().filter(|s| !s.is_empty()).unwrap_or(id),
        rule.hash_attribute.as_deref(),
        fallback,
        rule.range.as_ref(),
        rule.coverage,
        rule.hash_version,
    )
}

fn experiment_from_rule(id: &str, rule: &FeatureRule, variations: Vec<Value>) -> Experiment<Value> {
    let key = rule
        .key
        .clone()
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| id.to_owned());

    let mut experiment = Experiment::new(key, variations);
    experiment.coverage = rule.coverage;
    experiment.weights = rule.weights.clone();
    experiment.hash_attribute = rule.hash_attribute.clone();
    experiment.fallback_attribute = rule.fallback_attribute.clone();
    experiment.disable_sticky_bucketing = rule.disable_sticky_bucketing;
    experiment.bucket_version = rule.bucket_version;
    experiment.min_bucket_version = rule.min_bucket_version;
    experiment.namespace = rule.namespace.clone();
    experiment.meta = rule.meta.clone();
    experiment.ranges = rule.ranges.clone();
    experiment.name = rule.name.clone();
    experiment.phase = rule.phase.clone();
    experiment.seed = rule.seed.clone();
    experiment.hash_version = rule.hash_version;
    experiment.filters = rule.filters.clone();
    experiment.condition = rule.condition.clone();
    experiment
}

fn feature_result(
    ctx: &mut EvalContext<'_>,
    id: &str,
    value: Value,
    source: FeatureResultSource,
    rule_id: Option<&str>,
) -> FeatureResult {
    report_usage(ctx, id, FeatureResult::new(value, source, rule_id))
}

/// Add a usage event for every result except overrides.
fn report_usage(ctx: &mut EvalContext<'_>, id: &str, result: FeatureResult) -> FeatureResult {
    if result.source != FeatureResultSource::Override {
        ctx.events.push(EvalEvent::FeatureUsage {
            feature_key: id.to_owned(),
            result: result.clone(),
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::{json, Value};

    use super::eval_feature;
    use crate::{
        eval::{EvalContext, EvalOptions, UserContext},
        events::EvalEvent,
        experiment::{FeatureResult, FeatureResultSource},
        FeaturePayload,
    };

    fn payload(features: Value) -> FeaturePayload {
        serde_json::from_value(json!({ "features": features })).unwrap()
    }

    fn eval_with(
        payload: &FeaturePayload,
        options: &EvalOptions,
        attributes: Value,
        id: &str,
    ) -> (FeatureResult, Vec<EvalEvent>) {
        let user = UserContext::new(attributes.as_object().cloned().unwrap_or_default());
        let mut ctx = EvalContext::new(payload, options, &user);
        let result = eval_feature(id, &mut ctx);
        (result, ctx.into_parts().0)
    }

    fn eval(payload: &FeaturePayload, attributes: Value, id: &str) -> FeatureResult {
        eval_with(payload, &EvalOptions::default(), attributes, id).0
    }

    #[test]
    fn unknown_and_default() {
        let payload = payload(json!({ "feature": { "defaultValue": "blue" } }));

        let result = eval(&payload, json!({}), "missing");
        assert_eq!(result.source, FeatureResultSource::UnknownFeature);
        assert_eq!(result.value, Value::Null);
        assert!(result.off);

        let result = eval(&payload, json!({}), "feature");
        assert_eq!(result.source, FeatureResultSource::DefaultValue);
        assert_eq!(result.value, json!("blue"));
        assert!(result.on);
        assert_eq!(result.rule_id, "");
    }

    #[test]
    fn forced_rules_with_conditions() {
        let payload = payload(json!({
            "feature": {
                "defaultValue": 1,
                "rules": [
                    { "id": "r1", "condition": { "country": "US" }, "force": 2 },
                    { "id": "r2", "condition": { "country": "CA" }, "force": null }
                ]
            }
        }));

        let result = eval(&payload, json!({ "country": "US" }), "feature");
        assert_eq!(result.source, FeatureResultSource::Force);
        assert_eq!(result.value, json!(2));
        assert_eq!(result.rule_id, "r1");

        let result = eval(&payload, json!({ "country": "CA" }), "feature");
        assert_eq!(result.source, FeatureResultSource::Force);
        assert_eq!(result.value, Value::Null);

        let result = eval(&payload, json!({ "country": "MX" }), "feature");
        assert_eq!(result.source, FeatureResultSource::DefaultValue);
    }

    #[test]
    fn percentage_rollout() {
        // "feature" v1 hashes for users 1..=8:
        // 0.906, 0.845, 0.276, 0.943, 0.014, 0.089, 0.6, 0.411
        let payload = payload(json!({
            "feature": { "defaultValue": false, "rules": [{ "force": true, "coverage": 0.5 }] }
        }));
        let values: Vec<bool> = (1..=8)
            .map(|id| eval(&payload, json!({ "id": id.to_string() }), "feature").on)
            .collect();
        assert_eq!(values, [false, false, true, false, true, true, false, true]);

        // no hash attribute, no rollout
        assert!(!eval(&payload, json!({}), "feature").on);

        let payload = self::payload(json!({
            "feature": { "defaultValue": false, "rules": [{ "force": true, "coverage": 0 }] }
        }));
        assert!(!eval(&payload, json!({ "id": "5" }), "feature").on);

        // explicit seed and range
        let payload = self::payload(json!({
            "feature": { "defaultValue": false, "rules": [
                { "force": true, "seed": "rollout", "range": [0.3, 0.7] }
            ] }
        }));
        // "rollout" v1 hashes: 0.377, 0.018, 0.655, 0.392
        let values: Vec<bool> = (1..=4)
            .map(|id| eval(&payload, json!({ "id": id.to_string() }), "feature").on)
            .collect();
        assert_eq!(values, [true, false, true, true]);
    }

    #[test]
    fn filters_on_force_rules() {
        // "filter-seed" v2 hashes for users 1..=3: 0.7556, 0.0303, 0.2148
        let payload = payload(json!({
            "feature": { "defaultValue": 0, "rules": [
                { "force": 1, "filters": [{ "seed": "filter-seed", "ranges": [[0.0, 0.5]] }] }
            ] }
        }));
        let values: Vec<Value> = (1..=3)
            .map(|id| eval(&payload, json!({ "id": id.to_string() }), "feature").value)
            .collect();
        assert_eq!(values, [json!(0), json!(1), json!(1)]);
    }

    #[test]
    fn experiment_rules() {
        // "exp-rule" v1 hashes for users 1..=4: 0.756, 0.801, 0.134, 0.147
        let payload = payload(json!({
            "feature": { "defaultValue": "default", "rules": [
                {
                    "id": "exp",
                    "key": "exp-rule",
                    "variations": ["a", "b"],
                    "coverage": 0.4,
                    "meta": [{ "key": "a" }, { "key": "b" }]
                }
            ] }
        }));

        // ranges [0, 0.2) and [0.5, 0.7)
        let (result, events) = eval_with(
            &payload,
            &EvalOptions::default(),
            json!({ "id": "3" }),
            "feature",
        );
        assert_eq!(result.source, FeatureResultSource::Experiment);
        assert_eq!(result.value, json!("a"));
        assert_eq!(result.rule_id, "exp");
        let experiment_result = result.experiment_result.unwrap();
        assert_eq!(experiment_result.feature_id.as_deref(), Some("feature"));
        assert_eq!(experiment_result.key, "a");
        assert_eq!(result.experiment.unwrap().key, "exp-rule");
        assert!(events
            .iter()
            .any(|e| matches!(e, EvalEvent::ExperimentViewed(v) if v.experiment_key == "exp-rule")));

        let result = eval(&payload, json!({ "id": "1" }), "feature");
        assert_eq!(result.source, FeatureResultSource::DefaultValue);
    }

    #[test]
    fn passthrough_variations_fall_through() {
        let payload = payload(json!({
            "feature": { "defaultValue": "default", "rules": [
                {
                    "key": "holdout",
                    "variations": ["holdout", "holdout"],
                    "meta": [{ "key": "h0", "passthrough": true }, { "key": "h1", "passthrough": true }]
                },
                { "force": "next" }
            ] }
        }));

        let (result, events) = eval_with(&payload, &EvalOptions::default(), json!({ "id": "1" }), "feature");
        assert_eq!(result.source, FeatureResultSource::Force);
        assert_eq!(result.value, json!("next"));
        // the holdout exposure is still tracked
        assert!(events
            .iter()
            .any(|e| matches!(e, EvalEvent::ExperimentViewed(v) if v.experiment_key == "holdout")));
    }

    #[test]
    fn overrides_are_not_reported() {
        let payload = payload(json!({ "feature": { "defaultValue": 1 } }));
        let options = EvalOptions {
            forced_features: HashMap::from([("feature".to_owned(), json!(5))]),
            ..Default::default()
        };

        let (result, events) = eval_with(&payload, &options, json!({}), "feature");
        assert_eq!(result.source, FeatureResultSource::Override);
        assert_eq!(result.value, json!(5));
        assert!(events.is_empty());

        let (_, events) = eval_with(&payload, &EvalOptions::default(), json!({}), "feature");
        assert!(matches!(
            events.as_slice(),
            [EvalEvent::FeatureUsage { feature_key, .. }] if feature_key == "feature"
        ));
    }

    #[test]
    fn prerequisites() {
        let payload = payload(json!({
            "parent": { "defaultValue": true, "rules": [{ "condition": { "id": "blocked" }, "force": false }] },
            "gated": { "defaultValue": "on", "rules": [
                { "parentConditions": [{ "id": "parent", "condition": { "value": true }, "gate": true }] }
            ] },
            "soft": { "defaultValue": "default", "rules": [
                { "parentConditions": [{ "id": "parent", "condition": { "value": true } }], "force": "rule" }
            ] }
        }));

        let result = eval(&payload, json!({ "id": "ok" }), "gated");
        assert_eq!(result.source, FeatureResultSource::DefaultValue);
        assert_eq!(result.value, json!("on"));

        let result = eval(&payload, json!({ "id": "blocked" }), "gated");
        assert_eq!(result.source, FeatureResultSource::Prerequisite);
        assert_eq!(result.value, Value::Null);

        assert_eq!(eval(&payload, json!({ "id": "ok" }), "soft").value, json!("rule"));
        let result = eval(&payload, json!({ "id": "blocked" }), "soft");
        assert_eq!(result.source, FeatureResultSource::DefaultValue);
        assert_eq!(result.value, json!("default"));
    }

    #[test]
    fn cyclic_prerequisites() {
        let payload = payload(json!({
            "a": { "defaultValue": 1, "rules": [
                { "parentConditions": [{ "id": "b", "condition": { "value": 1 } }], "force": 2 }
            ] },
            "b": { "defaultValue": 1, "rules": [
                { "parentConditions": [{ "id": "c", "condition": { "value": 1 } }], "force": 2 }
            ] },
            "c": { "defaultValue": 1, "rules": [
                { "parentConditions": [{ "id": "a", "condition": { "value": 1 } }], "force": 2 }
            ] },
            "self": { "defaultValue": 1, "rules": [
                { "parentConditions": [{ "id": "self", "condition": { "value": 1 } }], "force": 2 }
            ] }
        }));

        assert_eq!(
            eval(&payload, json!({}), "a").source,
            FeatureResultSource::CyclicPrerequisite
        );
        assert_eq!(
            eval(&payload, json!({}), "self").source,
            FeatureResultSource::CyclicPrerequisite
        );
    }

    #[test]
    fn same_parent_twice_is_not_a_cycle() {
        let payload = payload(json!({
            "parent": { "defaultValue": true },
            "child": { "defaultValue": 0, "rules": [
                { "parentConditions": [
                    { "id": "parent", "condition": { "value": true } },
                    { "id": "parent", "condition": { "value": true } }
                ], "force": 1 }
            ] }
        }));
        assert_eq!(eval(&payload, json!({}), "child").value, json!(1));
    }
}
