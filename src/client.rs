use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;

#[cfg(doc)]
use crate::sync::CacheSettings;
use crate::{
    eval::{eval_feature, run_experiment, EvalContext, EvalOptions, UserContext},
    experiment::{Experiment, ExperimentResult, FeatureResult},
    payload::FeaturePayload,
    payload_store::PayloadStore,
    scoped::UserScopedClient,
    sticky_bucket::{sticky_bucket_attributes, StickyBucketDocs},
    sync::{FetchOptions, FetchRequest, SubscriptionId, SynchronizerState},
    tracking::{DedupState, EventDispatcher},
    ClientConfig, Error, Result,
};

/// A GrowthBook client that evaluates features for many users.
///
/// The client holds the feature payload and client-wide options. Each call takes the
/// [`UserContext`] to evaluate for. Use [`Client::scoped`] to bind a user once, or
/// [`GrowthBook`](crate::GrowthBook) for a single-user instance.
///
/// # Loading features
///
/// Call [`Client::load_features`] once to fetch the payload. After that, the payload is kept up to
/// date in the background when the server supports streaming (see
/// [`CacheSettings::background_sync`]).
///
/// # Examples
/// ```no_run
/// # async fn test() -> growthbook::Result<()> {
/// # use std::time::Duration;
/// use growthbook::{ClientConfig, UserContext};
///
/// let client = ClientConfig::new("sdk-abc123").to_client();
/// client.load_features(Some(Duration::from_secs(5))).await?;
///
/// let user = UserContext::new(serde_json::json!({"id": "123"}).as_object().cloned().unwrap());
/// if client.is_on("dark-mode", &user) {
///     // ...
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client {
    pub(crate) store: Arc<PayloadStore>,
    pub(crate) options: EvalOptions,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) dedup: DedupState,
    pub(crate) remote: Option<RemoteSource>,
}

/// Where a client's payload comes from, and its subscription to updates.
pub(crate) struct RemoteSource {
    synchronizer: Arc<SynchronizerState>,
    request: Mutex<FetchRequest>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl RemoteSource {
    fn request(&self) -> FetchRequest {
        self.request
            .lock()
            .expect("thread holding request lock should not panic")
            .clone()
    }

    async fn fetch(&self, options: FetchOptions) -> Result<Arc<FeaturePayload>> {
        let request = self.request();
        url::Url::parse(&request.api_host).map_err(Error::InvalidApiHost)?;
        self.synchronizer
            .fetch_features_with_cache(&request, options)
            .await
    }

    fn subscribe(&self, store: &Arc<PayloadStore>) {
        let mut subscription = self
            .subscription
            .lock()
            .expect("thread holding subscription lock should not panic");
        if subscription.is_none() {
            *subscription = Some(self.synchronizer.subscribe(self.request(), store.clone()));
        }
    }

    /// Replace the request, moving an active subscription over to it.
    pub(crate) fn set_request(&self, request: FetchRequest, store: &Arc<PayloadStore>) {
        *self
            .request
            .lock()
            .expect("thread holding request lock should not panic") = request;

        let mut subscription = self
            .subscription
            .lock()
            .expect("thread holding subscription lock should not panic");
        if let Some(id) = subscription.take() {
            self.synchronizer.unsubscribe(id);
            *subscription = Some(self.synchronizer.subscribe(self.request(), store.clone()));
        }
    }

    fn unsubscribe(&self) {
        let subscription = self
            .subscription
            .lock()
            .expect("thread holding subscription lock should not panic")
            .take();
        if let Some(id) = subscription {
            self.synchronizer.unsubscribe(id);
        }
    }
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// ```
    /// # use growthbook::{ClientConfig, Client};
    /// let client = Client::new(ClientConfig::new("sdk-abc123"));
    /// ```
    pub fn new(config: ClientConfig) -> Self {
        if config.remote_eval {
            log::warn!(target: "growthbook", "remote evaluation needs a single user, use GrowthBook instead. Evaluating locally");
        }
        Client::with_request(config.fetch_request(), config)
    }

    pub(crate) fn with_request(request: Option<FetchRequest>, config: ClientConfig) -> Self {
        let store = Arc::new(PayloadStore::new());
        if let Some(payload) = config.payload {
            store.set_payload(Arc::new(payload));
        }

        let remote = request.map(|request| RemoteSource {
            synchronizer: config
                .synchronizer
                .unwrap_or_else(SynchronizerState::global),
            request: Mutex::new(request),
            subscription: Mutex::new(None),
        });

        Client {
            store,
            options: config.options,
            dispatcher: config.dispatcher,
            dedup: DedupState::default(),
            remote,
        }
    }

    /// Run `f` over an evaluation context for `user`, then dispatch the produced events.
    /// Returns updated sticky bucket documents if any assignment changed.
    pub(crate) fn evaluate<R>(
        &self,
        user: &UserContext,
        dedup: &DedupState,
        usage_scope: &str,
        f: impl FnOnce(&mut EvalContext<'_>) -> R,
    ) -> (R, Option<StickyBucketDocs>) {
        let payload = self.store.get_payload().unwrap_or_default();
        let mut ctx = EvalContext::new(&payload, &self.options, user);
        let result = f(&mut ctx);
        let (events, docs) = ctx.into_parts();
        self.dispatcher.dispatch(events, dedup, usage_scope);
        (result, docs)
    }

    /// Evaluate for one of many users sharing `self.dedup`.
    fn evaluate_shared<R>(
        &self,
        user: &UserContext,
        f: impl FnOnce(&mut EvalContext<'_>) -> R,
    ) -> R {
        // Users are told apart by their attributes when reporting feature usage.
        let scope = match self.dispatcher.feature_usage_callback {
            Some(_) => serde_json::to_string(&user.attributes).unwrap_or_default(),
            None => String::new(),
        };
        self.evaluate(user, &self.dedup, &scope, f).0
    }

    /// Evaluate a feature for `user`.
    ///
    /// Evaluation never fails: unknown features evaluate to `null` with
    /// [`FeatureResultSource::UnknownFeature`](crate::experiment::FeatureResultSource::UnknownFeature).
    pub fn eval_feature(&self, key: &str, user: &UserContext) -> FeatureResult {
        self.evaluate_shared(user, |ctx| eval_feature(key, ctx))
    }

    /// Whether the feature's value is truthy.
    pub fn is_on(&self, key: &str, user: &UserContext) -> bool {
        self.eval_feature(key, user).on
    }

    /// Whether the feature's value is falsy.
    pub fn is_off(&self, key: &str, user: &UserContext) -> bool {
        self.eval_feature(key, user).off
    }

    /// The feature's value, or `default` if it's `null` or doesn't deserialize into `T`.
    ///
    /// ```
    /// # use growthbook::{ClientConfig, FeaturePayload, UserContext};
    /// let payload = FeaturePayload::from_json(br#"{"features": {"max-items": {"defaultValue": 10}}}"#)?;
    /// let client = ClientConfig::offline().payload(payload).to_client();
    ///
    /// let user = UserContext::default();
    /// assert_eq!(client.get_feature_value("max-items", &user, 5), 10);
    /// assert_eq!(client.get_feature_value("unknown", &user, 5), 5);
    /// assert_eq!(client.get_feature_value("max-items", &user, "x".to_owned()), "x");
    /// # Ok::<(), growthbook::Error>(())
    /// ```
    pub fn get_feature_value<T: DeserializeOwned>(&self, key: &str, user: &UserContext, default: T) -> T {
        let result = self.eval_feature(key, user);
        if result.value.is_null() {
            return default;
        }
        result.value_as().unwrap_or(default)
    }

    /// Run an inline experiment for `user`.
    pub fn run<T: Clone + Default>(
        &self,
        experiment: &Experiment<T>,
        user: &UserContext,
    ) -> ExperimentResult<T> {
        self.evaluate_shared(user, |ctx| run_experiment(experiment, ctx))
    }

    /// Bind `user` to this client. Sticky bucket documents are loaded when a sticky bucket
    /// service is configured.
    pub fn scoped(&self, user: UserContext) -> UserScopedClient<'_> {
        UserScopedClient::new(self, user)
    }

    /// Replace the payload.
    pub fn set_payload(&self, payload: FeaturePayload) {
        self.store.set_payload(Arc::new(payload));
    }

    /// Currently active payload, if any.
    pub fn payload(&self) -> Option<Arc<FeaturePayload>> {
        self.store.get_payload()
    }

    /// Load features, from the shared cache when possible, and keep them up to date.
    ///
    /// `timeout` bounds the wait, not the fetch: a fetch that doesn't finish in time keeps running
    /// and still updates this client when it completes.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingClientKey`] if the client was configured without a client key.
    /// - [`Error::InvalidApiHost`] if the API host is not a valid url.
    /// - [`Error::Timeout`] if `timeout` elapsed first.
    /// - Network, HTTP status, and payload decoding errors.
    pub async fn load_features(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        let remote = self.remote.as_ref().ok_or(Error::MissingClientKey)?;
        remote.subscribe(&self.store);
        let payload = remote
            .fetch(FetchOptions {
                timeout,
                allow_stale: true,
                skip_cache: false,
            })
            .await?;
        self.store.set_payload(payload);
        Ok(())
    }

    /// Fetch features again. Unlike [`Client::load_features`], stale cached payloads are not
    /// served unless `options.allow_stale` is set.
    ///
    /// # Errors
    ///
    /// Same as [`Client::load_features`].
    pub async fn refresh_features(&self, options: FetchOptions) -> Result<()> {
        let remote = self.remote.as_ref().ok_or(Error::MissingClientKey)?;
        let payload = remote.fetch(options).await?;
        self.store.set_payload(payload);
        Ok(())
    }

    /// Stop receiving payload updates. In-flight fetches shared with other clients keep running.
    pub fn destroy(&self) {
        if let Some(remote) = &self.remote {
            remote.unsubscribe();
        }
    }

    /// Load sticky bucket documents for `user` from the configured service. Without a service,
    /// this is a no-op and sticky bucketing stays disabled for the user.
    ///
    /// # Errors
    ///
    /// Errors from the sticky bucket service.
    pub fn refresh_sticky_buckets(&self, user: &mut UserContext) -> Result<()> {
        let Some(service) = &self.dispatcher.sticky_bucket_service else {
            return Ok(());
        };
        let payload = self.store.get_payload().unwrap_or_default();
        let attributes = sticky_bucket_attributes(&payload, &user.attributes);
        user.sticky_bucket_assignment_docs = Some(service.get_all_assignments(&attributes)?);
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
    use serde_json::json;

    use crate::{
        events::ExperimentViewedEvent,
        experiment::{Experiment, FeatureResult, FeatureResultSource},
        payload::FeaturePayload,
        sticky_bucket::{InMemoryStickyBucketService, StickyBucketService},
        sync::{CacheSettings, FetchRequest, FetchResponse, StreamEvent, SynchronizerState, Transport},
        Attributes, ClientConfig, Error, Result, UserContext,
    };

    fn user(id: &str) -> UserContext {
        let mut attributes = Attributes::new();
        attributes.insert("id".to_owned(), json!(id));
        UserContext::new(attributes)
    }

    fn payload() -> FeaturePayload {
        FeaturePayload::from_json(
            br#"{
                "features": {
                    "flag": {"defaultValue": true},
                    "color": {
                        "defaultValue": "blue",
                        "rules": [{"key": "color-exp", "variations": ["red", "green"]}]
                    }
                }
            }"#,
        )
        .unwrap()
    }

    struct CountingTransport {
        fetches: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn fetch(&self, _request: &FetchRequest) -> BoxFuture<'static, Result<FetchResponse>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(FetchResponse {
                    payload: FeaturePayload::from_json(
                        br#"{"features": {"flag": {"defaultValue": "remote"}}, "dateUpdated": "v1"}"#,
                    )?,
                    sse_supported: false,
                })
            }
            .boxed()
        }

        fn stream(&self, _request: &FetchRequest) -> BoxStream<'static, StreamEvent> {
            futures::stream::empty().boxed()
        }
    }

    #[test]
    fn evaluates_for_each_user() {
        let client = ClientConfig::offline().payload(payload()).to_client();

        assert!(client.is_on("flag", &user("1")));
        assert!(client.is_off("missing", &user("1")));
        assert!(client.get_feature_value("flag", &user("1"), false));

        let colors: Vec<String> = (1..=8)
            .map(|i| client.get_feature_value("color", &user(&i.to_string()), String::new()))
            .collect();
        assert!(colors.iter().any(|c| c == "red"));
        assert!(colors.iter().any(|c| c == "green"));
    }

    #[test]
    fn tracks_each_exposure_once() {
        let tracked = Arc::new(AtomicUsize::new(0));
        let counter = tracked.clone();
        let client = ClientConfig::offline()
            .payload(payload())
            .tracking_callback(move |_: ExperimentViewedEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .to_client();

        let experiment = Experiment::new("exp", vec![0, 1]);
        for _ in 0..3 {
            client.run(&experiment, &user("1"));
        }
        client.run(&experiment, &user("2"));

        assert_eq!(tracked.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn overrides_are_not_reported_as_usage() {
        let usages = Arc::new(AtomicUsize::new(0));
        let counter = usages.clone();
        let client = ClientConfig::offline()
            .payload(payload())
            .forced_features([("flag".to_owned(), json!(false))].into())
            .feature_usage_callback(move |_: &str, result: &FeatureResult| {
                assert_ne!(result.source, FeatureResultSource::Override);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .to_client();

        assert!(client.is_off("flag", &user("1")));
        assert!(client.is_on("color", &user("1")));
        assert_eq!(usages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn feature_usage_reported_once_per_user() {
        let reported = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = reported.clone();
        let client = ClientConfig::offline()
            .payload(payload())
            .feature_usage_callback(move |key: &str, result: &FeatureResult| {
                sink.lock().unwrap().push((key.to_owned(), result.value.clone()));
            })
            .to_client();

        assert_eq!(client.get_feature_value("color", &user("1"), String::new()), "green");
        assert_eq!(client.get_feature_value("color", &user("3"), String::new()), "red");
        client.eval_feature("color", &user("1"));
        client.eval_feature("flag", &user("1"));
        client.eval_feature("flag", &user("2"));

        assert_eq!(
            *reported.lock().unwrap(),
            vec![
                ("color".to_owned(), json!("green")),
                ("color".to_owned(), json!("red")),
                ("flag".to_owned(), json!(true)),
                ("flag".to_owned(), json!(true)),
            ]
        );
    }

    #[test]
    fn sticky_buckets_are_loaded_and_saved() {
        let service = Arc::new(InMemoryStickyBucketService::new());
        let client = ClientConfig::offline()
            .payload(payload())
            .sticky_bucket_service(service.clone())
            .to_client();

        let mut user = user("1");
        client.refresh_sticky_buckets(&mut user).unwrap();
        assert_eq!(user.sticky_bucket_assignment_docs, Some(Default::default()));

        let color = client.eval_feature("color", &user);
        let doc = service.get_assignments("id", "1").unwrap().unwrap();
        let variation_key = &doc.assignments["color-exp__0"];
        let expected = if color.value == json!("red") { "0" } else { "1" };
        assert_eq!(variation_key, expected);
    }

    #[tokio::test]
    async fn load_features_requires_client_key() {
        let client = ClientConfig::offline().to_client();
        assert!(matches!(
            client.load_features(None).await,
            Err(Error::MissingClientKey)
        ));
    }

    #[tokio::test]
    async fn clients_share_fetches_and_payload_updates() {
        let transport = Arc::new(CountingTransport {
            fetches: AtomicUsize::new(0),
        });
        let synchronizer = Arc::new(SynchronizerState::new(
            CacheSettings::default(),
            transport.clone(),
            None,
        ));
        let config = || {
            ClientConfig::new("sdk-abc")
                .api_host("https://growthbook.example.com")
                .synchronizer(synchronizer.clone())
        };

        let first = config().to_client();
        let second = config().to_client();
        first.load_features(None).await.unwrap();
        second.load_features(None).await.unwrap();

        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            second.get_feature_value("flag", &user("1"), String::new()),
            "remote"
        );

        let request = FetchRequest::new("https://growthbook.example.com", "sdk-abc");
        synchronizer.on_new_feature_data(
            &request,
            Arc::new(
                FeaturePayload::from_json(
                    br#"{"features": {"flag": {"defaultValue": "pushed"}}, "dateUpdated": "v2"}"#,
                )
                .unwrap(),
            ),
        );
        assert_eq!(
            first.get_feature_value("flag", &user("1"), String::new()),
            "pushed"
        );

        first.destroy();
        synchronizer.on_new_feature_data(
            &request,
            Arc::new(
                FeaturePayload::from_json(
                    br#"{"features": {"flag": {"defaultValue": "later"}}, "dateUpdated": "v3"}"#,
                )
                .unwrap(),
            ),
        );
        assert_eq!(
            first.get_feature_value("flag", &user("1"), String::new()),
            "pushed"
        );
        assert_eq!(
            second.get_feature_value("flag", &user("1"), String::new()),
            "later"
        );
    }

    #[tokio::test]
    async fn invalid_api_host_is_an_error() {
        let client = ClientConfig::new("sdk-abc").api_host("not a url").to_client();
        assert!(matches!(
            client.load_features(None).await,
            Err(Error::InvalidApiHost(_))
        ));
    }
}
