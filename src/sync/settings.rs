use std::time::Duration;

/// Configuration for the payload cache and background synchronization.
// Not implementing `Copy` as `cache_key` is a String.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// How long a cached payload is served without revalidation.
    ///
    /// Defaults to [`CacheSettings::DEFAULT_STALE_TTL`].
    pub stale_ttl: Duration,
    /// Cached payloads older than this are never served, even when stale payloads are allowed.
    ///
    /// Defaults to [`CacheSettings::DEFAULT_MAX_AGE`].
    pub max_age: Duration,
    /// Key under which the cache is persisted in [`KeyValueStorage`](crate::storage::KeyValueStorage).
    ///
    /// Defaults to [`CacheSettings::DEFAULT_CACHE_KEY`].
    pub cache_key: String,
    /// Keep payloads up to date in the background (server-sent events) when the server supports it.
    pub background_sync: bool,
    /// Maximum number of cache entries. The oldest entries are evicted first.
    ///
    /// Defaults to [`CacheSettings::DEFAULT_MAX_ENTRIES`].
    pub max_entries: usize,
    /// Keep streams open while the host is hidden.
    pub disable_idle_streams: bool,
    /// How long streams stay open after the host becomes hidden.
    ///
    /// Defaults to [`CacheSettings::DEFAULT_IDLE_STREAM_INTERVAL`].
    pub idle_stream_interval: Duration,
    /// Always go to the network, ignoring cached payloads.
    pub disable_cache: bool,
}

impl CacheSettings {
    /// Default value for [`CacheSettings::stale_ttl`].
    pub const DEFAULT_STALE_TTL: Duration = Duration::from_secs(60);
    /// Default value for [`CacheSettings::max_age`].
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
    /// Default value for [`CacheSettings::cache_key`].
    pub const DEFAULT_CACHE_KEY: &'static str = "gbFeaturesCache";
    /// Default value for [`CacheSettings::max_entries`].
    pub const DEFAULT_MAX_ENTRIES: usize = 10;
    /// Default value for [`CacheSettings::idle_stream_interval`].
    pub const DEFAULT_IDLE_STREAM_INTERVAL: Duration = Duration::from_secs(20);

    /// Create new `CacheSettings` using default configuration.
    pub fn new() -> CacheSettings {
        CacheSettings::default()
    }

    /// Update stale TTL with `stale_ttl`.
    pub fn with_stale_ttl(mut self, stale_ttl: Duration) -> CacheSettings {
        self.stale_ttl = stale_ttl;
        self
    }

    /// Update max age with `max_age`.
    pub fn with_max_age(mut self, max_age: Duration) -> CacheSettings {
        self.max_age = max_age;
        self
    }

    /// Update the persistent cache key with `cache_key`.
    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> CacheSettings {
        self.cache_key = cache_key.into();
        self
    }

    /// Enable or disable background synchronization.
    pub fn with_background_sync(mut self, background_sync: bool) -> CacheSettings {
        self.background_sync = background_sync;
        self
    }

    /// Update max number of cache entries with `max_entries`.
    pub fn with_max_entries(mut self, max_entries: usize) -> CacheSettings {
        self.max_entries = max_entries;
        self
    }

    /// Keep streams open while hidden.
    pub fn with_disable_idle_streams(mut self, disable_idle_streams: bool) -> CacheSettings {
        self.disable_idle_streams = disable_idle_streams;
        self
    }

    /// Update idle stream interval with `idle_stream_interval`.
    pub fn with_idle_stream_interval(mut self, idle_stream_interval: Duration) -> CacheSettings {
        self.idle_stream_interval = idle_stream_interval;
        self
    }

    /// Bypass the cache.
    pub fn with_disable_cache(mut self, disable_cache: bool) -> CacheSettings {
        self.disable_cache = disable_cache;
        self
    }
}

impl Default for CacheSettings {
    fn default() -> CacheSettings {
        CacheSettings {
            stale_ttl: CacheSettings::DEFAULT_STALE_TTL,
            max_age: CacheSettings::DEFAULT_MAX_AGE,
            cache_key: CacheSettings::DEFAULT_CACHE_KEY.to_owned(),
            background_sync: true,
            max_entries: CacheSettings::DEFAULT_MAX_ENTRIES,
            disable_idle_streams: false,
            idle_stream_interval: CacheSettings::DEFAULT_IDLE_STREAM_INTERVAL,
            disable_cache: false,
        }
    }
}
