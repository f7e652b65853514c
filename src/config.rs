use std::{collections::HashMap, sync::Arc};

use serde_json::Value;

use crate::{
    eval::{EvalOptions, UserContext},
    experiment::ExperimentOverride,
    payload::FeaturePayload,
    scoped::GrowthBook,
    sticky_bucket::StickyBucketService,
    sync::{FetchRequest, SynchronizerState},
    tracking::{EventDispatcher, FeatureUsageCallback, TrackingCallback},
    Client,
};

/// Configuration for [`Client`] and [`GrowthBook`].
///
/// # Examples
/// ```
/// # use growthbook::{events::ExperimentViewedEvent, ClientConfig};
/// let client = ClientConfig::new("sdk-abc123")
///     .tracking_callback(|event: ExperimentViewedEvent| {
///         println!("{:?}", event);
///     })
///     .to_client();
/// ```
pub struct ClientConfig {
    pub(crate) api_host: String,
    pub(crate) streaming_host: Option<String>,
    pub(crate) client_key: Option<String>,
    pub(crate) api_request_headers: HashMap<String, String>,
    pub(crate) remote_eval: bool,
    pub(crate) cache_key_attributes: Option<Vec<String>>,
    pub(crate) options: EvalOptions,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) synchronizer: Option<Arc<SynchronizerState>>,
    pub(crate) payload: Option<FeaturePayload>,
}

impl ClientConfig {
    /// Default host for API calls.
    pub const DEFAULT_API_HOST: &'static str = "https://cdn.growthbook.io";

    /// Create a default configuration using the specified client key.
    ///
    /// ```
    /// # use growthbook::ClientConfig;
    /// ClientConfig::new("sdk-abc123");
    /// ```
    pub fn new(client_key: impl Into<String>) -> Self {
        ClientConfig {
            client_key: Some(client_key.into()),
            ..ClientConfig::offline()
        }
    }

    /// Create a configuration without a client key. Features must be provided with
    /// [`ClientConfig::payload`] or [`Client::set_payload`], as nothing can be fetched.
    pub fn offline() -> Self {
        ClientConfig {
            api_host: ClientConfig::DEFAULT_API_HOST.to_owned(),
            streaming_host: None,
            client_key: None,
            api_request_headers: HashMap::new(),
            remote_eval: false,
            cache_key_attributes: None,
            options: EvalOptions::default(),
            dispatcher: EventDispatcher::default(),
            synchronizer: None,
            payload: None,
        }
    }

    /// Override host for API calls. Clients should use the default setting in most cases.
    pub fn api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into();
        self
    }

    /// Override host for server-sent events. Defaults to the API host.
    pub fn streaming_host(mut self, streaming_host: impl Into<String>) -> Self {
        self.streaming_host = Some(streaming_host.into());
        self
    }

    /// Send an extra header with every API request.
    pub fn api_request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.api_request_headers.insert(name.into(), value.into());
        self
    }

    /// Let the server evaluate features for the user. Only supported by [`GrowthBook`].
    pub fn remote_eval(mut self, remote_eval: bool) -> Self {
        self.remote_eval = remote_eval;
        self
    }

    /// Attributes that identify a cached remote evaluation. Defaults to all attributes.
    pub fn cache_key_attributes(mut self, attributes: Vec<String>) -> Self {
        self.cache_key_attributes = Some(attributes);
        self
    }

    /// When disabled, every experiment returns the baseline variation and nothing is tracked.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.options.enabled = enabled;
        self
    }

    /// In QA mode, experiments only return forced variations.
    pub fn qa_mode(mut self, qa_mode: bool) -> Self {
        self.options.qa_mode = qa_mode;
        self
    }

    /// Default url for url targeting and query string overrides.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.options.url = Some(url.into());
        self
    }

    pub fn forced_variations(mut self, forced_variations: HashMap<String, usize>) -> Self {
        self.options.forced_variations = forced_variations;
        self
    }

    pub fn forced_features(mut self, forced_features: HashMap<String, Value>) -> Self {
        self.options.forced_features = forced_features;
        self
    }

    /// Partial experiment definitions merged over experiments with the same key.
    pub fn overrides(mut self, overrides: HashMap<String, ExperimentOverride>) -> Self {
        self.options.overrides = overrides;
        self
    }

    /// Enabled groups. Experiments restricted to groups only run when one of them is enabled.
    pub fn groups(mut self, groups: HashMap<String, bool>) -> Self {
        self.options.groups = groups;
        self
    }

    /// Set tracking callback to pass experiment exposures to your analytics tool.
    ///
    /// ```
    /// # use growthbook::{events::ExperimentViewedEvent, ClientConfig};
    /// let config = ClientConfig::new("sdk-abc123").tracking_callback(|event: ExperimentViewedEvent| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn tracking_callback(
        mut self,
        tracking_callback: impl TrackingCallback + Send + Sync + 'static,
    ) -> Self {
        self.dispatcher.tracking_callback = Some(Arc::new(tracking_callback));
        self
    }

    /// Set callback to be notified of feature evaluations.
    pub fn feature_usage_callback(
        mut self,
        feature_usage_callback: impl FeatureUsageCallback + Send + Sync + 'static,
    ) -> Self {
        self.dispatcher.feature_usage_callback = Some(Arc::new(feature_usage_callback));
        self
    }

    /// Enable sticky bucketing backed by `service`.
    pub fn sticky_bucket_service(mut self, service: Arc<dyn StickyBucketService>) -> Self {
        self.dispatcher.sticky_bucket_service = Some(service);
        self
    }

    /// Use `synchronizer` instead of [`SynchronizerState::global`].
    pub fn synchronizer(mut self, synchronizer: Arc<SynchronizerState>) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    /// Initial features.
    pub fn payload(mut self, payload: FeaturePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub(crate) fn fetch_request(&self) -> Option<FetchRequest> {
        let client_key = self.client_key.as_ref()?;
        let mut request = FetchRequest::new(self.api_host.as_str(), client_key.as_str());
        if let Some(streaming_host) = &self.streaming_host {
            request.streaming_host = streaming_host.trim_end_matches('/').to_owned();
        }
        request.headers = self.api_request_headers.clone();
        Some(request)
    }

    /// Create a new multi-user [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use growthbook::{ClientConfig, Client};
    /// let client: Client = ClientConfig::new("sdk-abc123").to_client();
    /// ```
    pub fn to_client(self) -> Client {
        Client::new(self)
    }

    /// Create a new single-user [`GrowthBook`] instance for `user`.
    pub fn to_growthbook(self, user: UserContext) -> GrowthBook {
        GrowthBook::new(self, user)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::offline()
    }
}
