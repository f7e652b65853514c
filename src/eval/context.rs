use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
};

use serde_json::Value;

use crate::{
    attributes::to_hash_value,
    events::EvalEvent,
    experiment::ExperimentOverride,
    payload::SavedGroups,
    sticky_bucket::StickyBucketDocs,
    Attributes, FeaturePayload,
};

/// Client-wide evaluation settings.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// When `false`, every experiment is skipped (users get the baseline variation).
    pub enabled: bool,
    /// QA mode: experiments only return forced variations.
    pub qa_mode: bool,
    /// Default url, used when the user context doesn't set one.
    pub url: Option<String>,
    pub forced_variations: HashMap<String, usize>,
    pub forced_features: HashMap<String, Value>,
    pub overrides: HashMap<String, ExperimentOverride>,
    pub groups: HashMap<String, bool>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            enabled: true,
            qa_mode: false,
            url: None,
            forced_variations: HashMap::new(),
            forced_features: HashMap::new(),
            overrides: HashMap::new(),
            groups: HashMap::new(),
        }
    }
}

/// Everything known about the user (or request) being evaluated.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub attributes: Attributes,
    pub url: Option<String>,
    /// Take precedence over the client-wide forced variations.
    pub forced_variations: HashMap<String, usize>,
    /// Take precedence over the client-wide forced features.
    pub forced_features: HashMap<String, Value>,
    /// Preloaded sticky bucket documents. `None` disables sticky bucketing.
    pub sticky_bucket_assignment_docs: Option<StickyBucketDocs>,
}

impl UserContext {
    pub fn new(attributes: Attributes) -> Self {
        UserContext {
            attributes,
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// State of a single top-level evaluation.
///
/// Borrows the payload snapshot, client options, and user, and accumulates the side effects of
/// evaluation. Sticky bucket documents are copied on first write.
pub struct EvalContext<'a> {
    pub(crate) payload: &'a FeaturePayload,
    pub(crate) options: &'a EvalOptions,
    pub(crate) user: &'a UserContext,
    pub(crate) sticky_docs: Option<Cow<'a, StickyBucketDocs>>,
    /// Features on the current prerequisite chain.
    pub(crate) evaluated_features: HashSet<String>,
    pub(crate) events: Vec<EvalEvent>,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        payload: &'a FeaturePayload,
        options: &'a EvalOptions,
        user: &'a UserContext,
    ) -> EvalContext<'a> {
        EvalContext {
            payload,
            options,
            user,
            sticky_docs: user.sticky_bucket_assignment_docs.as_ref().map(Cow::Borrowed),
            evaluated_features: HashSet::new(),
            events: Vec::new(),
        }
    }

    /// Events produced so far.
    pub fn events(&self) -> &[EvalEvent] {
        &self.events
    }

    /// Consume the context, returning produced events and, if any assignment changed, the
    /// updated sticky bucket documents.
    pub fn into_parts(self) -> (Vec<EvalEvent>, Option<StickyBucketDocs>) {
        let docs = match self.sticky_docs {
            Some(Cow::Owned(docs)) => Some(docs),
            _ => None,
        };
        (self.events, docs)
    }

    /// Prepare for the next top-level evaluation with the same context.
    pub(crate) fn reset_stack(&mut self) {
        self.evaluated_features.clear();
    }

    pub(crate) fn saved_groups(&self) -> &'a SavedGroups {
        &self.payload.saved_groups
    }

    pub(crate) fn url(&self) -> &'a str {
        self.user
            .url
            .as_deref()
            .or(self.options.url.as_deref())
            .unwrap_or_default()
    }

    pub(crate) fn forced_feature(&self, id: &str) -> Option<&'a Value> {
        self.user
            .forced_features
            .get(id)
            .or_else(|| self.options.forced_features.get(id))
    }

    pub(crate) fn forced_variation(&self, key: &str) -> Option<usize> {
        self.user
            .forced_variations
            .get(key)
            .or_else(|| self.options.forced_variations.get(key))
            .copied()
    }

    pub(crate) fn sticky_bucketing_enabled(&self) -> bool {
        self.sticky_docs.is_some()
    }

    /// Resolve the attribute used for hashing. Defaults to `id`. `fallback` is used only when
    /// the primary attribute has no usable value.
    ///
    /// Returns the attribute name and its value, `None` when neither is set.
    pub(crate) fn hash_attribute(
        &self,
        attribute: Option<&str>,
        fallback: Option<&str>,
    ) -> (String, Option<String>) {
        let attribute = attribute.filter(|a| !a.is_empty()).unwrap_or("id");
        if let Some(value) = to_hash_value(self.user.attributes.get(attribute)) {
            return (attribute.to_owned(), Some(value));
        }
        if let Some(fallback) = fallback.filter(|f| !f.is_empty()) {
            if let Some(value) = to_hash_value(self.user.attributes.get(fallback)) {
                return (fallback.to_owned(), Some(value));
            }
        }
        (attribute.to_owned(), None)
    }
}
