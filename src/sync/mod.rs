//! Payload cache and background synchronization.
//!
//! [`SynchronizerState`] owns every shared network resource: the payload cache, in-flight
//! fetches, subscriptions, and event streams. Resources are owned by a key (`api_host` and
//! `client_key`), not by any single client, so any number of clients sharing a key produce at most
//! one concurrent fetch and one event stream.
//!
//! Fetches run in spawned Tokio tasks. A timeout at the call site returns early without aborting
//! the transfer, and the result still lands in the cache for the next caller.
use std::{
    collections::{HashMap, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, OnceLock, Weak},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt, StreamExt,
};
use tokio::task::AbortHandle;

use crate::{payload::FeaturePayload, storage::KeyValueStorage, Error, Result};

mod cache;
mod channel;
mod request;
mod settings;
mod transport;

use cache::PayloadCache;
use channel::{backoff, ChannelState, ScopedChannel};

pub use cache::CacheEntry;
pub use request::{FetchRequest, RemoteEvalRequest};
pub use settings::CacheSettings;
pub use transport::{FetchResponse, HttpTransport, SseFrame, StreamEvent, Transport};

/// Receives new payloads for a key.
///
/// Implemented for closures and for [`PayloadStore`](crate::payload_store::PayloadStore).
pub trait PayloadSubscriber: Send + Sync {
    fn on_payload(&self, payload: Arc<FeaturePayload>);
}

impl<T: Fn(Arc<FeaturePayload>) + Send + Sync> PayloadSubscriber for T {
    fn on_payload(&self, payload: Arc<FeaturePayload>) {
        self(payload);
    }
}

/// Returned by [`SynchronizerState::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Per-call fetch options.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Stop waiting after `timeout`. The fetch itself keeps running.
    pub timeout: Option<Duration>,
    /// Serve a stale cached payload (and revalidate it in the background).
    pub allow_stale: bool,
    /// Always go to the network.
    pub skip_cache: bool,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<FeaturePayload>>>>;

struct Subscription {
    id: SubscriptionId,
    request: FetchRequest,
    subscriber: Arc<dyn PayloadSubscriber>,
}

#[derive(Default)]
struct Inner {
    cache_initialized: bool,
    cache: PayloadCache,
    /// Keyed by cache key.
    active_fetches: HashMap<String, SharedFetch>,
    /// Keyed by [`FetchRequest::key`].
    subscriptions: HashMap<String, Vec<Subscription>>,
    /// Keyed by [`FetchRequest::key`].
    channels: HashMap<String, ScopedChannel>,
    supports_sse: HashSet<String>,
    next_subscription_id: u64,
    idle_timer: Option<AbortHandle>,
}

/// Shared cache, fetch coalescing, subscriptions, and event streams.
///
/// Most applications use [`SynchronizerState::global`]. Tests and applications that need
/// isolated caches create their own.
pub struct SynchronizerState {
    settings: CacheSettings,
    transport: Arc<dyn Transport>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    inner: Mutex<Inner>,
}

impl SynchronizerState {
    pub fn new(
        settings: CacheSettings,
        transport: Arc<dyn Transport>,
        storage: Option<Arc<dyn KeyValueStorage>>,
    ) -> SynchronizerState {
        SynchronizerState {
            settings,
            transport,
            storage,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Process-wide state over [`HttpTransport`] with default [`CacheSettings`] and no persistent
    /// storage. Created on first use.
    pub fn global() -> Arc<SynchronizerState> {
        static GLOBAL: OnceLock<Arc<SynchronizerState>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                Arc::new(SynchronizerState::new(
                    CacheSettings::default(),
                    Arc::new(HttpTransport::new()),
                    None,
                ))
            })
            .clone()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("thread holding synchronizer lock should not panic")
    }

    /// Load the persisted cache the first time the cache is touched.
    fn init_cache(&self, inner: &mut Inner) {
        if inner.cache_initialized {
            return;
        }
        inner.cache_initialized = true;

        let Some(storage) = &self.storage else {
            return;
        };
        match storage.get_item(&self.settings.cache_key) {
            Ok(Some(json)) => {
                if let Err(err) = inner.cache.load_json(&json, self.settings.max_entries) {
                    log::warn!(target: "growthbook", "ignoring corrupt persisted cache: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!(target: "growthbook", "failed to read persisted cache: {err}");
            }
        }
    }

    fn persist(&self, inner: &Inner) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result = inner
            .cache
            .to_json()
            .and_then(|json| storage.set_item(&self.settings.cache_key, &json));
        if let Err(err) = result {
            log::warn!(target: "growthbook", "failed to persist cache: {err}");
        }
    }

    /// Cached entry for `request`, if any.
    pub fn cache_entry(&self, request: &FetchRequest) -> Option<CacheEntry> {
        let mut inner = self.lock();
        self.init_cache(&mut inner);
        inner.cache.get(&request.cache_key()).cloned()
    }

    /// Get the payload for `request`, from the cache when possible.
    ///
    /// A fresh cached payload is returned immediately. A stale one is returned only when
    /// `options.allow_stale` is set, and is revalidated in the background. Payloads older than
    /// [`CacheSettings::max_age`] are never served. Otherwise this waits for a network fetch,
    /// joining one already in flight for the same cache key.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if `options.timeout` elapsed first. The fetch keeps running.
    /// - Network, HTTP status, and payload decoding errors from the fetch.
    pub async fn fetch_features_with_cache(
        self: &Arc<Self>,
        request: &FetchRequest,
        options: FetchOptions,
    ) -> Result<Arc<FeaturePayload>> {
        let cached = if options.skip_cache || self.settings.disable_cache {
            None
        } else {
            self.cache_entry(request)
        };

        if let Some(entry) = cached {
            let now = Utc::now();
            let min_stale_at = now
                .checked_sub_signed(to_time_delta(self.settings.max_age))
                .and_then(|t| t.checked_add_signed(to_time_delta(self.settings.stale_ttl)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            if (options.allow_stale || entry.stale_at > now) && entry.stale_at > min_stale_at {
                if entry.sse {
                    self.lock().supports_sse.insert(request.key());
                }
                if entry.stale_at <= now {
                    log::debug!(target: "growthbook", client_key = request.client_key.as_str(); "serving stale features, revalidating");
                    drop(self.start_fetch(request));
                } else {
                    self.start_auto_refresh(request, false);
                }
                return Ok(entry.data);
            }
        }

        let fetch = self.start_fetch(request);
        match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fetch)
                .await
                .map_err(|_| Error::Timeout)?,
            None => fetch.await,
        }
    }

    /// Fetch the payload for `request` from the network, joining a fetch already in flight for
    /// the same cache key.
    pub async fn fetch_features(self: &Arc<Self>, request: &FetchRequest) -> Result<Arc<FeaturePayload>> {
        self.start_fetch(request).await
    }

    fn start_fetch(self: &Arc<Self>, request: &FetchRequest) -> SharedFetch {
        let cache_key = request.cache_key();

        let mut inner = self.lock();
        if let Some(fetch) = inner.active_fetches.get(&cache_key) {
            return fetch.clone();
        }

        let state = Arc::clone(self);
        let request = request.clone();
        let key = cache_key.clone();
        let task = tokio::spawn(async move {
            let result = match state.transport.fetch(&request).await {
                Ok(response) => {
                    let payload = Arc::new(response.payload);
                    if response.sse_supported {
                        state.lock().supports_sse.insert(request.key());
                    }
                    state.on_new_feature_data(&request, payload.clone());
                    state.start_auto_refresh(&request, false);
                    Ok(payload)
                }
                Err(err) => {
                    log::warn!(target: "growthbook", client_key = request.client_key.as_str(); "error while fetching features: {err}");
                    Err(err)
                }
            };
            state.lock().active_fetches.remove(&key);
            result
        });

        let fetch = async move {
            task.await.unwrap_or_else(|err| {
                log::warn!(target: "growthbook", "fetch task failed: {err}");
                Err(Error::FetchTaskFailed)
            })
        }
        .boxed()
        .shared();

        inner.active_fetches.insert(cache_key, fetch.clone());
        fetch
    }

    /// Commit a new payload for `request`.
    ///
    /// If the payload's version (`dateUpdated`) is unchanged, only the cache entry's staleness
    /// clock is extended. Otherwise the cache is updated, persisted, and every subscriber sharing
    /// the cache key is notified.
    pub fn on_new_feature_data(&self, request: &FetchRequest, payload: Arc<FeaturePayload>) {
        let cache_key = request.cache_key();
        let version = payload.date_updated.clone().unwrap_or_default();
        let stale_at = Utc::now()
            .checked_add_signed(to_time_delta(self.settings.stale_ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let subscribers: Vec<Arc<dyn PayloadSubscriber>> = {
            let mut inner = self.lock();
            self.init_cache(&mut inner);

            if let Some(existing) = inner.cache.get_mut(&cache_key) {
                if !version.is_empty() && existing.version == version {
                    existing.stale_at = stale_at;
                    self.persist(&inner);
                    return;
                }
            }

            let sse = inner.supports_sse.contains(&request.key());
            inner.cache.insert(
                cache_key.clone(),
                CacheEntry {
                    data: payload.clone(),
                    version,
                    stale_at,
                    sse,
                },
                self.settings.max_entries,
            );
            self.persist(&inner);

            let subscribers = inner
                .subscriptions
                .get(&request.key())
                .into_iter()
                .flatten()
                .filter(|subscription| subscription.request.cache_key() == cache_key)
                .map(|subscription| subscription.subscriber.clone())
                .collect();
            subscribers
        };

        for subscriber in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber.on_payload(payload.clone())));
            if outcome.is_err() {
                log::warn!(target: "growthbook", cache_key = cache_key.as_str(); "payload subscriber panicked");
            }
        }
    }

    /// Push new payloads for `request` to `subscriber` until it's unsubscribed.
    pub fn subscribe(
        &self,
        request: FetchRequest,
        subscriber: Arc<dyn PayloadSubscriber>,
    ) -> SubscriptionId {
        let mut inner = self.lock();
        inner.next_subscription_id += 1;
        let id = SubscriptionId(inner.next_subscription_id);
        inner
            .subscriptions
            .entry(request.key())
            .or_default()
            .push(Subscription {
                id,
                request,
                subscriber,
            });
        id
    }

    /// Remove a subscription. The key's event stream is closed once nobody is subscribed to it.
    /// In-flight fetches are not cancelled.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.lock();
        let mut emptied = None;
        for (key, subscriptions) in inner.subscriptions.iter_mut() {
            subscriptions.retain(|subscription| subscription.id != id);
            if subscriptions.is_empty() {
                emptied = Some(key.clone());
            }
        }
        if let Some(key) = emptied {
            inner.subscriptions.remove(&key);
            if inner.channels.remove(&key).is_some() {
                log::debug!(target: "growthbook", key = key.as_str(); "closing stream without subscribers");
            }
        }
    }

    /// Open the key's event stream, if the server supports streaming and it isn't open yet.
    /// `force_sse` assumes support without waiting for the server to announce it.
    pub fn start_auto_refresh(self: &Arc<Self>, request: &FetchRequest, force_sse: bool) {
        if !self.settings.background_sync {
            return;
        }
        let key = request.key();

        let mut inner = self.lock();
        if force_sse {
            inner.supports_sse.insert(key.clone());
        }
        if !inner.supports_sse.contains(&key) || inner.channels.contains_key(&key) {
            return;
        }

        let mut channel = ScopedChannel::new(request.clone());
        self.connect(&key, &mut channel);
        inner.channels.insert(key, channel);
    }

    fn connect(self: &Arc<Self>, key: &str, channel: &mut ScopedChannel) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!(target: "growthbook", key = key; "no Tokio runtime, not streaming features");
            return;
        };
        channel.disconnect(ChannelState::Active);

        log::debug!(target: "growthbook", key = key; "opening feature stream");
        let task = runtime.spawn(run_channel(
            Arc::downgrade(self),
            key.to_owned(),
            channel.generation,
            channel.request.clone(),
        ));
        channel.task = Some(task.abort_handle());
    }

    fn channel_opened(&self, key: &str, generation: u64) {
        let mut inner = self.lock();
        if let Some(channel) = inner.channels.get_mut(key) {
            if channel.generation == generation {
                channel.errors = 0;
            }
        }
    }

    /// Returns the delay before reconnecting, or `None` if the channel shouldn't reconnect.
    fn channel_closed(&self, key: &str, generation: u64) -> Option<Duration> {
        let mut inner = self.lock();
        let channel = inner.channels.get_mut(key)?;
        if channel.generation != generation || channel.state == ChannelState::Idle {
            return None;
        }
        channel.errors += 1;
        channel.state = ChannelState::Disabled;
        let delay = backoff(channel.errors);
        log::debug!(target: "growthbook", key = key, errors = channel.errors, delay_ms = delay.as_millis() as u64; "feature stream closed, reconnecting");
        Some(delay)
    }

    fn channel_reconnecting(&self, key: &str, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.channels.get_mut(key) {
            Some(channel) if channel.generation == generation && channel.state != ChannelState::Idle => {
                channel.state = ChannelState::Active;
                true
            }
            _ => false,
        }
    }

    fn on_stream_message(self: &Arc<Self>, key: &str, frame: SseFrame) {
        match frame.event.as_str() {
            "features" => {
                let Some(request) = self.lock().channels.get(key).map(|c| c.request.clone()) else {
                    return;
                };
                match FeaturePayload::from_json(frame.data.as_bytes()) {
                    Ok(payload) => self.on_new_feature_data(&request, Arc::new(payload)),
                    Err(err) => {
                        log::warn!(target: "growthbook", key = key; "failed to parse streamed features: {err}");
                    }
                }
            }
            "features-updated" => {
                let requests: Vec<FetchRequest> = self
                    .lock()
                    .subscriptions
                    .get(key)
                    .into_iter()
                    .flatten()
                    .map(|subscription| subscription.request.clone())
                    .collect();
                for request in requests {
                    drop(self.start_fetch(&request));
                }
            }
            event => {
                log::trace!(target: "growthbook", key = key, event = event; "ignoring stream event");
            }
        }
    }

    /// The host went to the background. Streams are closed after
    /// [`CacheSettings::idle_stream_interval`] unless [`SynchronizerState::on_visible`] is called
    /// first.
    pub fn on_hidden(self: &Arc<Self>) {
        if self.settings.disable_idle_streams {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!(target: "growthbook", "no Tokio runtime, streams stay open while hidden");
            return;
        };

        let state = Arc::downgrade(self);
        let interval = self.settings.idle_stream_interval;
        let timer = runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(state) = state.upgrade() {
                state.idle_channels();
            }
        });

        if let Some(previous) = self.lock().idle_timer.replace(timer.abort_handle()) {
            previous.abort();
        }
    }

    fn idle_channels(&self) {
        let mut inner = self.lock();
        inner.idle_timer = None;
        for (key, channel) in inner.channels.iter_mut() {
            if channel.state != ChannelState::Idle {
                log::debug!(target: "growthbook", key = key.as_str(); "closing idle feature stream");
                channel.disconnect(ChannelState::Idle);
            }
        }
    }

    /// The host is back in the foreground. Idle streams reconnect immediately.
    pub fn on_visible(self: &Arc<Self>) {
        let mut inner = self.lock();
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        for (key, channel) in inner.channels.iter_mut() {
            if channel.state == ChannelState::Idle {
                self.connect(key, channel);
            }
        }
    }

    /// Drop every cached payload, stream, and subscription, and clear the persisted cache.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.cache.clear();
        inner.active_fetches.clear();
        inner.subscriptions.clear();
        inner.channels.clear();
        inner.supports_sse.clear();
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        inner.cache_initialized = false;
        self.persist(&inner);
    }
}

/// Drive a channel's event stream, reconnecting with backoff until the channel is idled,
/// replaced, or dropped.
async fn run_channel(
    state: Weak<SynchronizerState>,
    key: String,
    generation: u64,
    request: FetchRequest,
) {
    loop {
        let mut stream = match state.upgrade() {
            Some(state) => state.transport.stream(&request),
            None => return,
        };

        while let Some(event) = stream.next().await {
            let Some(state) = state.upgrade() else {
                return;
            };
            match event {
                StreamEvent::Open => state.channel_opened(&key, generation),
                StreamEvent::Message(frame) => state.on_stream_message(&key, frame),
                StreamEvent::Error(err) => {
                    log::warn!(target: "growthbook", key = key.as_str(); "feature stream error: {err}");
                }
            }
        }

        let delay = match state.upgrade() {
            Some(state) => match state.channel_closed(&key, generation) {
                Some(delay) => delay,
                None => return,
            },
            None => return,
        };
        tokio::time::sleep(delay).await;

        match state.upgrade() {
            Some(state) if state.channel_reconnecting(&key, generation) => {}
            _ => return,
        }
    }
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
