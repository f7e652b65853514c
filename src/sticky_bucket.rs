//! Sticky bucketing: persisting experiment assignments so users keep their variation when the
//! experiment configuration changes.
//!
//! Assignments are stored per identifying attribute in a [`StickyAssignmentsDocument`]. The
//! evaluation core reads them through the user context and emits updated documents as events;
//! adapters persist those through a [`StickyBucketService`].
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    attributes::to_hash_value,
    payload::{TryParse, VariationMeta},
    storage::KeyValueStorage,
    Attributes,
    FeaturePayload, Result,
};

/// `experimentKey__bucketVersion` to variation key.
pub type StickyAssignments = HashMap<String, String>;

/// Documents keyed by `attributeName||attributeValue`.
pub type StickyBucketDocs = HashMap<String, StickyAssignmentsDocument>;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyAssignmentsDocument {
    pub attribute_name: String,
    pub attribute_value: String,
    #[serde(default)]
    pub assignments: StickyAssignments,
}

pub fn get_sticky_bucket_attribute_key(attribute_name: &str, attribute_value: &str) -> String {
    format!("{attribute_name}||{attribute_value}")
}

pub fn get_sticky_bucket_experiment_key(experiment_key: &str, bucket_version: u32) -> String {
    format!("{experiment_key}__{bucket_version}")
}

/// Storage backend for sticky assignment documents.
///
/// Backends only differ in transport; merging is done by the caller before
/// [`save_assignments`](StickyBucketService::save_assignments), so a saved document always
/// replaces the stored one.
pub trait StickyBucketService: Send + Sync {
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Result<Option<StickyAssignmentsDocument>>;

    fn save_assignments(&self, doc: &StickyAssignmentsDocument) -> Result<()>;

    /// Load documents for every `(attribute name, attribute value)` pair.
    ///
    /// The default implementation issues one [`get_assignments`](Self::get_assignments) per
    /// attribute. Backends with a bulk read should override it.
    fn get_all_assignments(&self, attributes: &HashMap<String, String>) -> Result<StickyBucketDocs> {
        let mut docs = StickyBucketDocs::new();
        for (name, value) in attributes {
            if let Some(doc) = self.get_assignments(name, value)? {
                docs.insert(get_sticky_bucket_attribute_key(name, value), doc);
            }
        }
        Ok(docs)
    }
}

/// Keeps documents in memory.
#[derive(Debug, Default)]
pub struct InMemoryStickyBucketService {
    docs: Mutex<StickyBucketDocs>,
}

impl InMemoryStickyBucketService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StickyBucketService for InMemoryStickyBucketService {
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Result<Option<StickyAssignmentsDocument>> {
        let docs = self
            .docs
            .lock()
            .expect("thread holding sticky bucket lock should not panic");
        Ok(docs
            .get(&get_sticky_bucket_attribute_key(attribute_name, attribute_value))
            .cloned())
    }

    fn save_assignments(&self, doc: &StickyAssignmentsDocument) -> Result<()> {
        let mut docs = self
            .docs
            .lock()
            .expect("thread holding sticky bucket lock should not panic");
        docs.insert(
            get_sticky_bucket_attribute_key(&doc.attribute_name, &doc.attribute_value),
            doc.clone(),
        );
        Ok(())
    }
}

/// Stores documents as JSON in a [`KeyValueStorage`] under `prefix + attributeName||attributeValue`.
pub struct StorageStickyBucketService {
    prefix: String,
    storage: Arc<dyn KeyValueStorage>,
}

impl StorageStickyBucketService {
    pub const DEFAULT_PREFIX: &'static str = "gbStickyBuckets__";

    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::with_prefix(storage, Self::DEFAULT_PREFIX)
    }

    pub fn with_prefix(storage: Arc<dyn KeyValueStorage>, prefix: impl Into<String>) -> Self {
        StorageStickyBucketService {
            prefix: prefix.into(),
            storage,
        }
    }

    fn key(&self, attribute_name: &str, attribute_value: &str) -> String {
        format!(
            "{}{}",
            self.prefix,
            get_sticky_bucket_attribute_key(attribute_name, attribute_value)
        )
    }
}

impl StickyBucketService for StorageStickyBucketService {
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Result<Option<StickyAssignmentsDocument>> {
        let Some(raw) = self
            .storage
            .get_item(&self.key(attribute_name, attribute_value))?
        else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(doc) => Ok(Some(doc)),
            Err(err) => {
                log::warn!(target: "growthbook", attribute_name, attribute_value; "ignoring corrupt sticky bucket document: {err}");
                Ok(None)
            }
        }
    }

    fn save_assignments(&self, doc: &StickyAssignmentsDocument) -> Result<()> {
        let raw = serde_json::to_string(doc)?;
        self.storage
            .set_item(&self.key(&doc.attribute_name, &doc.attribute_value), &raw)
    }
}

/// Merge assignments of the fallback attribute document with those of the hash attribute
/// document. The hash attribute wins on conflicts.
pub(crate) fn merged_assignments(
    docs: &StickyBucketDocs,
    hash_key: &str,
    fallback_key: Option<&str>,
) -> StickyAssignments {
    let mut assignments = StickyAssignments::new();
    if let Some(doc) = fallback_key.and_then(|key| docs.get(key)) {
        assignments.extend(doc.assignments.clone());
    }
    if let Some(doc) = docs.get(hash_key) {
        assignments.extend(doc.assignments.clone());
    }
    assignments
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StickyBucketVariation {
    pub variation: Option<usize>,
    pub version_is_blocked: bool,
}

/// Resolve a stored assignment back to a variation index.
///
/// Any stored assignment for a bucket version below `min_bucket_version` blocks the user from
/// the experiment entirely.
pub(crate) fn sticky_bucket_variation(
    assignments: &StickyAssignments,
    experiment_key: &str,
    bucket_version: u32,
    min_bucket_version: u32,
    meta: &[VariationMeta],
) -> StickyBucketVariation {
    let blocked = (0..min_bucket_version).any(|version| {
        assignments.contains_key(&get_sticky_bucket_experiment_key(experiment_key, version))
    });
    if blocked {
        return StickyBucketVariation {
            variation: None,
            version_is_blocked: true,
        };
    }

    let Some(variation_key) =
        assignments.get(&get_sticky_bucket_experiment_key(experiment_key, bucket_version))
    else {
        return StickyBucketVariation::default();
    };

    StickyBucketVariation {
        variation: meta
            .iter()
            .position(|m| m.key.as_deref() == Some(variation_key.as_str())),
        version_is_blocked: false,
    }
}

/// Merge `assignments` into the existing document for the attribute. Returns the document key,
/// the merged document, and whether anything changed.
pub(crate) fn generate_sticky_bucket_assignment_doc(
    docs: &StickyBucketDocs,
    attribute_name: &str,
    attribute_value: &str,
    assignments: StickyAssignments,
) -> (String, StickyAssignmentsDocument, bool) {
    let key = get_sticky_bucket_attribute_key(attribute_name, attribute_value);
    let existing = docs
        .get(&key)
        .map(|doc| doc.assignments.clone())
        .unwrap_or_default();

    let mut merged = existing.clone();
    merged.extend(assignments);
    let changed = merged != existing;

    let doc = StickyAssignmentsDocument {
        attribute_name: attribute_name.to_owned(),
        attribute_value: attribute_value.to_owned(),
        assignments: merged,
    };
    (key, doc, changed)
}

/// Attributes that identify users for sticky bucketing in `payload`, with their values for the
/// given user. Used to preload documents before evaluation.
pub fn sticky_bucket_attributes(
    payload: &FeaturePayload,
    attributes: &Attributes,
) -> HashMap<String, String> {
    let mut names = HashSet::new();

    for feature in payload.features.values() {
        let TryParse::Parsed(feature) = feature else {
            continue;
        };
        for rule in &feature.rules {
            if rule.variations.is_some() {
                names.insert(rule.hash_attribute.clone().unwrap_or_else(|| "id".to_owned()));
                if let Some(fallback) = &rule.fallback_attribute {
                    names.insert(fallback.clone());
                }
            }
        }
    }

    for experiment in &payload.experiments {
        names.insert(
            experiment
                .get("hashAttribute")
                .and_then(Value::as_str)
                .unwrap_or("id")
                .to_owned(),
        );
        if let Some(fallback) = experiment.get("fallbackAttribute").and_then(Value::as_str) {
            names.insert(fallback.to_owned());
        }
    }

    names
        .into_iter()
        .filter_map(|name| {
            let value = to_hash_value(attributes.get(&name))?;
            Some((name, value))
        })
        .collect()
}
