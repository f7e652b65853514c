//! Clients bound to a single user.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard},
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    eval::{eval_feature, run_experiment, EvalContext, UserContext},
    experiment::{Experiment, ExperimentResult, FeatureResult},
    payload::FeaturePayload,
    sticky_bucket::StickyBucketDocs,
    sync::{FetchOptions, FetchRequest, RemoteEvalRequest},
    tracking::DedupState,
    Attributes, Client, ClientConfig, Result,
};

/// Evaluation for one user, shared by [`UserScopedClient`] and [`GrowthBook`].
struct UserScope {
    user: RwLock<UserContext>,
}

impl UserScope {
    fn new(user: UserContext) -> UserScope {
        UserScope {
            user: RwLock::new(user),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, UserContext> {
        self.user
            .read()
            .expect("thread holding user lock should not panic")
    }

    fn update(&self, f: impl FnOnce(&mut UserContext)) {
        let mut user = self
            .user
            .write()
            .expect("thread holding user lock should not panic");
        f(&mut user);
    }

    /// Evaluate with the current user, keeping sticky bucket documents that changed.
    fn evaluate<R>(
        &self,
        client: &Client,
        dedup: &DedupState,
        f: impl FnOnce(&mut EvalContext<'_>) -> R,
    ) -> R {
        let (result, docs) = {
            let user = self.read();
            client.evaluate(&user, dedup, "", f)
        };
        if let Some(docs) = docs {
            self.set_sticky_docs(docs);
        }
        result
    }

    fn set_sticky_docs(&self, docs: StickyBucketDocs) {
        self.update(|user| user.sticky_bucket_assignment_docs = Some(docs));
    }

    /// Reload sticky bucket documents, keeping sticky bucketing enabled if the service fails.
    fn refresh_sticky_buckets(&self, client: &Client) -> Result<()> {
        if client.dispatcher.sticky_bucket_service.is_none() {
            return Ok(());
        }
        let mut user = self.read().clone();
        let result = client.refresh_sticky_buckets(&mut user);
        if result.is_err() && user.sticky_bucket_assignment_docs.is_none() {
            user.sticky_bucket_assignment_docs = Some(StickyBucketDocs::new());
        }
        self.set_sticky_docs(user.sticky_bucket_assignment_docs.unwrap_or_default());
        result
    }
}

/// A [`Client`] bound to one user.
///
/// Exposures are deduplicated per scoped client, and sticky bucket assignments made during
/// evaluation are kept for subsequent calls.
///
/// ```
/// # use growthbook::{ClientConfig, FeaturePayload, UserContext};
/// let payload = FeaturePayload::from_json(br#"{"features": {"dark-mode": {"defaultValue": true}}}"#)?;
/// let client = ClientConfig::offline().payload(payload).to_client();
///
/// let user = client.scoped(UserContext::default());
/// assert!(user.is_on("dark-mode"));
/// # Ok::<(), growthbook::Error>(())
/// ```
pub struct UserScopedClient<'a> {
    client: &'a Client,
    scope: UserScope,
    dedup: DedupState,
}

impl<'a> UserScopedClient<'a> {
    pub(crate) fn new(client: &'a Client, user: UserContext) -> Self {
        let scoped = UserScopedClient {
            client,
            scope: UserScope::new(user),
            dedup: DedupState::default(),
        };
        if let Err(err) = scoped.scope.refresh_sticky_buckets(client) {
            log::warn!(target: "growthbook", "failed to load sticky bucket assignments: {err}");
        }
        scoped
    }

    /// A copy of the user context.
    pub fn user(&self) -> UserContext {
        self.scope.read().clone()
    }

    pub fn eval_feature(&self, key: &str) -> FeatureResult {
        self.scope
            .evaluate(self.client, &self.dedup, |ctx| eval_feature(key, ctx))
    }

    pub fn is_on(&self, key: &str) -> bool {
        self.eval_feature(key).on
    }

    pub fn is_off(&self, key: &str) -> bool {
        self.eval_feature(key).off
    }

    /// The feature's value, or `default` if it's `null` or doesn't deserialize into `T`.
    pub fn get_feature_value<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        feature_value(self.eval_feature(key), default)
    }

    pub fn run<T: Clone + Default>(&self, experiment: &Experiment<T>) -> ExperimentResult<T> {
        self.scope
            .evaluate(self.client, &self.dedup, |ctx| run_experiment(experiment, ctx))
    }

    /// Reload sticky bucket documents from the configured service.
    pub fn refresh_sticky_buckets(&self) -> Result<()> {
        self.scope.refresh_sticky_buckets(self.client)
    }
}

/// A single-user GrowthBook instance.
///
/// Owns its [`Client`]. Supports remote evaluation, where the server evaluates features for the
/// user and returns a reduced payload.
///
/// ```
/// # use growthbook::{ClientConfig, FeaturePayload, UserContext};
/// let payload = FeaturePayload::from_json(br#"{"features": {"banner": {"defaultValue": "hello"}}}"#)?;
/// let gb = ClientConfig::offline().payload(payload).to_growthbook(UserContext::default());
///
/// assert_eq!(gb.get_feature_value("banner", String::new()), "hello");
/// # Ok::<(), growthbook::Error>(())
/// ```
pub struct GrowthBook {
    client: Client,
    scope: UserScope,
    /// Set in remote evaluation mode.
    remote_eval: Option<RemoteEvalSettings>,
}

struct RemoteEvalSettings {
    base_request: FetchRequest,
    cache_key_attributes: Option<Vec<String>>,
    default_url: Option<String>,
}

impl RemoteEvalSettings {
    fn request(&self, user: &UserContext) -> FetchRequest {
        FetchRequest {
            remote_eval: Some(RemoteEvalRequest {
                attributes: user.attributes.clone(),
                forced_variations: user.forced_variations.clone(),
                forced_features: user.forced_features.clone(),
                url: user
                    .url
                    .clone()
                    .or_else(|| self.default_url.clone())
                    .unwrap_or_default(),
                cache_key_attributes: self.cache_key_attributes.clone(),
            }),
            ..self.base_request.clone()
        }
    }
}

impl GrowthBook {
    pub(crate) fn new(config: ClientConfig, user: UserContext) -> GrowthBook {
        let base_request = config.fetch_request();
        let remote_eval = match (config.remote_eval, base_request) {
            (true, Some(base_request)) => Some(RemoteEvalSettings {
                base_request,
                cache_key_attributes: config.cache_key_attributes.clone(),
                default_url: config.options.url.clone(),
            }),
            (true, None) => {
                log::warn!(target: "growthbook", "remote evaluation needs a client key. Evaluating locally");
                None
            }
            (false, _) => None,
        };

        let request = match &remote_eval {
            Some(settings) => Some(settings.request(&user)),
            None => config.fetch_request(),
        };
        let gb = GrowthBook {
            client: Client::with_request(request, config),
            scope: UserScope::new(user),
            remote_eval,
        };
        gb.refresh_sticky_buckets_or_warn();
        gb
    }

    fn refresh_sticky_buckets_or_warn(&self) {
        if let Err(err) = self.scope.refresh_sticky_buckets(&self.client) {
            log::warn!(target: "growthbook", "failed to load sticky bucket assignments: {err}");
        }
    }

    /// Rebuild the remote evaluation request after the user changed.
    fn user_changed(&self) {
        if let (Some(settings), Some(remote)) = (&self.remote_eval, &self.client.remote) {
            let request = settings.request(&self.scope.read());
            remote.set_request(request, &self.client.store);
        }
    }

    /// A copy of the user context.
    pub fn user(&self) -> UserContext {
        self.scope.read().clone()
    }

    pub fn attributes(&self) -> Attributes {
        self.scope.read().attributes.clone()
    }

    /// Replace the user's attributes and reload sticky bucket documents.
    ///
    /// In remote evaluation mode, call [`GrowthBook::refresh_features`] to fetch features for the
    /// new attributes.
    pub fn set_attributes(&self, attributes: Attributes) {
        self.scope.update(|user| user.attributes = attributes);
        self.refresh_sticky_buckets_or_warn();
        self.user_changed();
    }

    pub fn set_url(&self, url: impl Into<String>) {
        let url = url.into();
        self.scope.update(|user| user.url = Some(url));
        self.user_changed();
    }

    pub fn set_forced_variations(&self, forced_variations: HashMap<String, usize>) {
        self.scope
            .update(|user| user.forced_variations = forced_variations);
        self.user_changed();
    }

    pub fn set_forced_features(&self, forced_features: HashMap<String, Value>) {
        self.scope
            .update(|user| user.forced_features = forced_features);
        self.user_changed();
    }

    pub fn eval_feature(&self, key: &str) -> FeatureResult {
        self.scope
            .evaluate(&self.client, &self.client.dedup, |ctx| eval_feature(key, ctx))
    }

    pub fn is_on(&self, key: &str) -> bool {
        self.eval_feature(key).on
    }

    pub fn is_off(&self, key: &str) -> bool {
        self.eval_feature(key).off
    }

    /// The feature's value, or `default` if it's `null` or doesn't deserialize into `T`.
    pub fn get_feature_value<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        feature_value(self.eval_feature(key), default)
    }

    pub fn run<T: Clone + Default>(&self, experiment: &Experiment<T>) -> ExperimentResult<T> {
        self.scope
            .evaluate(&self.client, &self.client.dedup, |ctx| run_experiment(experiment, ctx))
    }

    /// Replace the payload and reload sticky bucket documents.
    pub fn set_payload(&self, payload: FeaturePayload) {
        self.client.set_payload(payload);
        self.refresh_sticky_buckets_or_warn();
    }

    pub fn payload(&self) -> Option<Arc<FeaturePayload>> {
        self.client.payload()
    }

    /// See [`Client::load_features`].
    pub async fn load_features(&self, timeout: Option<Duration>) -> Result<()> {
        self.client.load_features(timeout).await?;
        self.refresh_sticky_buckets_or_warn();
        Ok(())
    }

    /// See [`Client::refresh_features`].
    pub async fn refresh_features(&self, options: FetchOptions) -> Result<()> {
        self.client.refresh_features(options).await?;
        self.refresh_sticky_buckets_or_warn();
        Ok(())
    }

    /// Reload sticky bucket documents from the configured service.
    pub fn refresh_sticky_buckets(&self) -> Result<()> {
        self.scope.refresh_sticky_buckets(&self.client)
    }

    /// Stop receiving payload updates.
    pub fn destroy(&self) {
        self.client.destroy();
    }
}

fn feature_value<T: DeserializeOwned>(result: FeatureResult, default: T) -> T {
    if result.value.is_null() {
        return default;
    }
    result.value_as().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
    use serde_json::json;

    use crate::{
        events::ExperimentViewedEvent,
        payload::FeaturePayload,
        sticky_bucket::{InMemoryStickyBucketService, StickyAssignmentsDocument, StickyBucketService},
        sync::{CacheSettings, FetchRequest, FetchResponse, StreamEvent, SynchronizerState, Transport},
        Attributes, ClientConfig, Result, UserContext,
    };

    fn attributes(id: &str) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("id".to_owned(), json!(id));
        attributes
    }

    fn payload() -> FeaturePayload {
        FeaturePayload::from_json(
            br#"{
                "features": {
                    "color": {
                        "defaultValue": "blue",
                        "rules": [{"key": "color-exp", "variations": ["red", "green"]}]
                    }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn scoped_clients_dedup_exposures_separately() {
        let tracked = Arc::new(AtomicUsize::new(0));
        let counter = tracked.clone();
        let client = ClientConfig::offline()
            .payload(payload())
            .tracking_callback(move |_: ExperimentViewedEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .to_client();

        let first = client.scoped(UserContext::new(attributes("1")));
        let second = client.scoped(UserContext::new(attributes("1")));
        first.eval_feature("color");
        first.eval_feature("color");
        second.eval_feature("color");

        assert_eq!(tracked.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sticky_assignment_survives_payload_change() {
        let service = Arc::new(InMemoryStickyBucketService::new());
        let gb = ClientConfig::offline()
            .payload(payload())
            .sticky_bucket_service(service.clone())
            .to_growthbook(UserContext::new(attributes("1")));

        // user "1" hashes to 0.853 under "color-exp"
        assert_eq!(gb.get_feature_value("color", String::new()), "green");
        assert_eq!(
            service.get_assignments("id", "1").unwrap(),
            Some(StickyAssignmentsDocument {
                attribute_name: "id".to_owned(),
                attribute_value: "1".to_owned(),
                assignments: [("color-exp__0".to_owned(), "1".to_owned())].into(),
            })
        );

        gb.set_payload(
            FeaturePayload::from_json(
                br#"{
                    "features": {
                        "color": {
                            "defaultValue": "blue",
                            "rules": [{"key": "color-exp", "variations": ["red", "green"], "weights": [0.99, 0.01]}]
                        }
                    }
                }"#,
            )
            .unwrap(),
        );

        let result = gb.eval_feature("color");
        assert_eq!(result.value, json!("green"));
        assert!(result.experiment_result.unwrap().sticky_bucket_used);
    }

    #[test]
    fn forced_variations_and_features_apply_to_user() {
        let gb = ClientConfig::offline()
            .payload(payload())
            .to_growthbook(UserContext::new(attributes("1")));

        gb.set_forced_variations([("color-exp".to_owned(), 0)].into());
        assert_eq!(gb.get_feature_value("color", String::new()), "red");

        gb.set_forced_features([("color".to_owned(), json!("black"))].into());
        assert_eq!(gb.get_feature_value("color", String::new()), "black");

        gb.set_attributes(attributes("2"));
        assert_eq!(gb.attributes()["id"], json!("2"));
    }

    struct RecordingTransport {
        requests: Mutex<Vec<FetchRequest>>,
    }

    impl Transport for RecordingTransport {
        fn fetch(&self, request: &FetchRequest) -> BoxFuture<'static, Result<FetchResponse>> {
            self.requests.lock().unwrap().push(request.clone());
            let id = request
                .remote_eval
                .as_ref()
                .and_then(|body| body.attributes.get("id").cloned())
                .unwrap_or_default();
            async move {
                let json = json!({
                    "features": {"greeting": {"defaultValue": format!("hello {}", id.as_str().unwrap_or_default())}}
                });
                Ok(FetchResponse {
                    payload: serde_json::from_value(json)?,
                    sse_supported: false,
                })
            }
            .boxed()
        }

        fn stream(&self, _request: &FetchRequest) -> BoxStream<'static, StreamEvent> {
            futures::stream::empty().boxed()
        }
    }

    #[tokio::test]
    async fn remote_eval_fetches_per_user() {
        let transport = Arc::new(RecordingTransport {
            requests: Mutex::new(Vec::new()),
        });
        let synchronizer = Arc::new(SynchronizerState::new(
            CacheSettings::default(),
            transport.clone(),
            None,
        ));
        let gb = ClientConfig::new("sdk-abc")
            .remote_eval(true)
            .synchronizer(synchronizer)
            .to_growthbook(UserContext::new(attributes("1")));

        gb.load_features(None).await.unwrap();
        assert_eq!(gb.get_feature_value("greeting", String::new()), "hello 1");

        gb.set_attributes(attributes("2"));
        gb.refresh_features(Default::default()).await.unwrap();
        assert_eq!(gb.get_feature_value("greeting", String::new()), "hello 2");

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].cache_key(), requests[1].cache_key());
    }
}
