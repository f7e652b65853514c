use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::FeaturePayload;

/// A cached payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub data: Arc<FeaturePayload>,
    /// Version token of the payload (its `dateUpdated`).
    #[serde(default)]
    pub version: String,
    /// Serialized as RFC 3339.
    pub stale_at: DateTime<Utc>,
    #[serde(default)]
    pub sse: bool,
}

/// In-memory payload cache, bounded by number of entries.
#[derive(Debug, Default)]
pub(crate) struct PayloadCache {
    entries: HashMap<String, CacheEntry>,
}

impl PayloadCache {
    pub(crate) fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Insert an entry, then evict the entries with the oldest `stale_at` until at most
    /// `max_entries` remain.
    pub(crate) fn insert(&mut self, key: String, entry: CacheEntry, max_entries: usize) {
        self.entries.insert(key, entry);
        self.evict(max_entries);
    }

    fn evict(&mut self, max_entries: usize) {
        let excess = self.entries.len().saturating_sub(max_entries);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(String, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.stale_at))
            .collect();
        by_age.sort_by_key(|(_, stale_at)| *stale_at);

        for (key, _) in by_age.into_iter().take(excess) {
            log::debug!(target: "growthbook", cache_key = key.as_str(); "evicting cache entry");
            self.entries.remove(&key);
        }
    }

    /// JSON array of `[key, entry]` pairs.
    pub(crate) fn to_json(&self) -> crate::Result<String> {
        let pairs: Vec<(&String, &CacheEntry)> = self.entries.iter().collect();
        Ok(serde_json::to_string(&pairs)?)
    }

    /// Load entries persisted by [`PayloadCache::to_json`], keeping already cached entries.
    pub(crate) fn load_json(&mut self, json: &str, max_entries: usize) -> crate::Result<()> {
        let pairs: Vec<(String, CacheEntry)> = serde_json::from_str(json)?;
        for (key, entry) in pairs {
            self.entries.entry(key).or_insert(entry);
        }
        self.evict(max_entries);
        Ok(())
    }
}
