//! Process-local cache tier
//!
//! Moka cache with per-entry expiry taken from each entry's memory TTL.

use moka::sync::Cache;
use moka::Expiry;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct MemoryEntry {
    value: serde_json::Value,
    ttl: Duration,
    tags: BTreeSet<String>,
    size: u64,
}

struct EntryExpiry;

impl Expiry<String, Arc<MemoryEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<MemoryEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<MemoryEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Short-lived, capacity-bounded tier
pub struct MemoryTier {
    inner: Cache<String, Arc<MemoryEntry>>,
}

impl MemoryTier {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .expire_after(EntryExpiry)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.get(key).map(|entry| entry.value.clone())
    }

    /// Insert with its own TTL; a zero TTL keeps the key out of this tier
    pub fn insert(
        &self,
        key: String,
        value: serde_json::Value,
        ttl: Duration,
        tags: &BTreeSet<String>,
    ) {
        if ttl.is_zero() {
            self.inner.invalidate(&key);
            return;
        }

        let size = (key.len() + value.to_string().len()) as u64;
        self.inner.insert(
            key,
            Arc::new(MemoryEntry {
                value,
                ttl,
                tags: tags.clone(),
                size,
            }),
        );
    }

    pub fn remove(&self, key: &str) {
        self.inner.invalidate(key);
    }

    /// Remove keys starting with `prefix`, returning them
    pub fn remove_prefix(&self, prefix: &str) -> Vec<String> {
        self.remove_matching(|key, _| key.starts_with(prefix))
    }

    /// Remove keys tagged with `tag`, returning them
    pub fn remove_tag(&self, tag: &str) -> Vec<String> {
        self.remove_matching(|_, entry| entry.tags.contains(tag))
    }

    fn remove_matching<P>(&self, predicate: P) -> Vec<String>
    where
        P: Fn(&str, &MemoryEntry) -> bool,
    {
        let keys: Vec<String> = self
            .inner
            .iter()
            .filter(|(key, entry)| predicate(key.as_str(), entry))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        for key in &keys {
            self.inner.invalidate(key);
        }
        keys
    }

    /// (live keys, approximate bytes)
    pub fn stats(&self) -> (u64, u64) {
        self.inner
            .iter()
            .fold((0, 0), |(keys, size), (_, entry)| (keys + 1, size + entry.size))
    }
}
