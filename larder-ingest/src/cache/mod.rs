//! Tiered result cache
//!
//! Two tiers sit behind one `get_or_set` contract:
//! - memory: process-local, short TTL, may be cold per process
//! - shared: long TTL, visible to every worker process
//!
//! A shared hit back-fills the memory tier. Concurrent misses on the same
//! key may each run the factory; results must be idempotent. Backing-store
//! failures degrade to a miss or a skipped write and never fail the caller.

mod memory;
mod shared;
mod sqlite;

pub use memory::MemoryTier;
pub use shared::{MemorySharedStore, SharedStore};
pub use sqlite::SqliteSharedStore;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use larder_common::config::CacheConfig;
use larder_common::Result;

/// A stored cache value with its expiry metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub stored_at: DateTime<Utc>,
    /// Shared tier lifetime
    pub ttl: Duration,
    /// Memory tier lifetime
    pub memory_ttl: Duration,
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.stored_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Time left before the shared entry expires
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at() - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Per-call cache options
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub memory_ttl: Duration,
    pub tags: BTreeSet<String>,
}

impl CacheOptions {
    pub fn new(ttl: Duration, memory_ttl: Duration) -> Self {
        Self {
            ttl,
            memory_ttl,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.memory_ttl())
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

/// Cache diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Live keys in the memory tier
    pub keys: u64,
    /// Approximate bytes held by the memory tier
    pub size: u64,
    /// Unexpired keys in the shared tier (None if the store could not be read)
    pub shared_keys: Option<u64>,
    pub hits: u64,
    pub misses: u64,
}

/// Memoizing key/value cache with a memory tier and a shared tier
pub struct ResultCache {
    memory: MemoryTier,
    shared: Arc<dyn SharedStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(memory_capacity: u64, shared: Arc<dyn SharedStore>) -> Self {
        Self {
            memory: MemoryTier::new(memory_capacity),
            shared,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `key`, or run `factory` and store its result
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, factory: F, options: &CacheOptions) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.get_or_try_set(
            key,
            || async move { Ok::<T, Infallible>(factory().await) },
            options,
        )
        .await
        .unwrap_or_else(|never| match never {})
    }

    /// Fallible variant: factory errors are returned to the caller and never cached
    pub async fn get_or_try_set<T, E, F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: &CacheOptions,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.lookup::<T>(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "Cache miss, computing value");

        let value = factory().await?;
        self.store(key, &value, options).await;
        Ok(value)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(raw) = self.memory.get(key) {
            match serde_json::from_value::<T>(raw) {
                Ok(value) => {
                    debug!(key, tier = "memory", "Cache hit");
                    return Some(value);
                }
                Err(e) => {
                    warn!(key, error = %e, "Discarding undecodable memory cache entry");
                    self.memory.remove(key);
                }
            }
        }

        let entry = match self.shared.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Shared cache read failed, treating as miss");
                return None;
            }
        };

        let now = Utc::now();
        if entry.is_expired(now) {
            return None;
        }

        match serde_json::from_value::<T>(entry.value.clone()) {
            Ok(value) => {
                debug!(key, tier = "shared", "Cache hit");
                let memory_ttl = entry.memory_ttl.min(entry.remaining(now));
                self.memory
                    .insert(key.to_string(), entry.value, memory_ttl, &entry.tags);
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "Shared cache entry has unexpected shape, treating as miss");
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, options: &CacheOptions) {
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "Value not serializable, skipping cache write");
                return;
            }
        };

        // The memory copy must not outlive the entry itself
        let memory_ttl = options.memory_ttl.min(options.ttl);
        self.memory
            .insert(key.to_string(), json.clone(), memory_ttl, &options.tags);

        let entry = CacheEntry {
            key: key.to_string(),
            value: json,
            stored_at: Utc::now(),
            ttl: options.ttl,
            memory_ttl: options.memory_ttl,
            tags: options.tags.clone(),
        };

        if let Err(e) = self.shared.set(entry).await {
            warn!(key, error = %e, "Shared cache write failed, value kept in memory tier only");
        }
    }

    /// Remove every entry whose key starts with `prefix`; returns distinct keys removed
    pub async fn invalidate_by_pattern(&self, prefix: &str) -> Result<u64> {
        let mut removed: HashSet<String> = self.memory.remove_prefix(prefix).into_iter().collect();
        removed.extend(self.shared.delete_prefix(prefix).await?);

        debug!(prefix, removed = removed.len(), "Invalidated cache entries by prefix");
        Ok(removed.len() as u64)
    }

    /// Remove every entry carrying `tag`; returns distinct keys removed
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<u64> {
        let mut removed: HashSet<String> = self.memory.remove_tag(tag).into_iter().collect();
        removed.extend(self.shared.delete_tag(tag).await?);

        debug!(tag, removed = removed.len(), "Invalidated cache entries by tag");
        Ok(removed.len() as u64)
    }

    /// Drop expired shared-tier rows
    pub async fn purge_expired(&self) -> Result<u64> {
        self.shared.purge_expired().await
    }

    /// Diagnostics only
    pub async fn get_stats(&self) -> CacheStats {
        let (keys, size) = self.memory.stats();
        let shared_keys = match self.shared.len().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Shared cache size unavailable");
                None
            }
        };

        CacheStats {
            keys,
            size,
            shared_keys,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_common::Error;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> ResultCache {
        ResultCache::new(100, Arc::new(MemorySharedStore::new()))
    }

    fn options() -> CacheOptions {
        CacheOptions::new(Duration::from_secs(60), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_second_call_within_ttl_skips_factory() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let key = "parse:1 cup flour_ab12cd34";

        let first: String = cache
            .get_or_set(
                key,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "parsed".to_string()
                },
                &options(),
            )
            .await;

        let second: String = cache
            .get_or_set(
                key,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "other".to_string()
                },
                &options(),
            )
            .await;

        assert_eq!(first, "parsed");
        assert_eq!(second, "parsed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.get_stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.shared_keys, Some(1));
    }

    #[tokio::test]
    async fn test_factory_error_is_not_cached() {
        let cache = cache();

        let failed: std::result::Result<u32, Error> = cache
            .get_or_try_set(
                "k",
                || async { Err(Error::Internal("boom".to_string())) },
                &options(),
            )
            .await;
        assert!(failed.is_err());

        let value: std::result::Result<u32, Error> =
            cache.get_or_try_set("k", || async { Ok(7) }, &options()).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_shared_hit_survives_cold_memory_tier() {
        let shared: Arc<dyn SharedStore> = Arc::new(MemorySharedStore::new());
        let warm = ResultCache::new(100, shared.clone());
        let _: u32 = warm.get_or_set("k", || async { 42 }, &options()).await;

        // Another process: same shared store, empty memory tier
        let cold = ResultCache::new(100, shared);
        let calls = AtomicUsize::new(0);
        let value: u32 = cold
            .get_or_set(
                "k",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    0
                },
                &options(),
            )
            .await;
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cold.get_stats().await.keys, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_recomputes() {
        let cache = cache();
        let short = CacheOptions::new(Duration::from_millis(30), Duration::from_millis(30));

        let _: u32 = cache.get_or_set("k", || async { 1 }, &short).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let value: u32 = cache.get_or_set("k", || async { 2 }, &short).await;

        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_memory_tier_never_outlives_ttl() {
        let cache = cache();
        let skewed = CacheOptions::new(Duration::from_millis(30), Duration::from_secs(10));
        let calls = AtomicUsize::new(0);

        let first: u32 = cache
            .get_or_set(
                "k",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    1
                },
                &skewed,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second: u32 = cache
            .get_or_set(
                "k",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    2
                },
                &skewed,
            )
            .await;

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_counts_distinct_keys() {
        let cache = cache();
        for key in ["parse:a_1", "parse:b_1", "grammar:a_1"] {
            let _: u32 = cache.get_or_set(key, || async { 1 }, &options()).await;
        }

        let removed = cache.invalidate_by_pattern("parse:").await.unwrap();
        assert_eq!(removed, 2);

        let calls = AtomicUsize::new(0);
        let _: u32 = cache
            .get_or_set(
                "parse:a_1",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    1
                },
                &options(),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.invalidate_by_pattern("nothing:").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let cache = cache();
        let tagged = options().with_tag("note:N1");
        let _: u32 = cache.get_or_set("a", || async { 1 }, &tagged).await;
        let _: u32 = cache.get_or_set("b", || async { 2 }, &tagged).await;
        let _: u32 = cache.get_or_set("c", || async { 3 }, &options()).await;

        assert_eq!(cache.invalidate_by_tag("note:N1").await.unwrap(), 2);
        assert_eq!(cache.get_stats().await.keys, 1);
    }

    #[test]
    fn test_entry_expiry_arithmetic() {
        let entry = CacheEntry {
            key: "k".to_string(),
            value: serde_json::json!(1),
            stored_at: Utc::now(),
            ttl: Duration::from_secs(60),
            memory_ttl: Duration::from_secs(5),
            tags: BTreeSet::new(),
        };
        assert!(!entry.is_expired(entry.stored_at));
        assert!(entry.is_expired(entry.stored_at + chrono::Duration::seconds(61)));
        assert_eq!(entry.remaining(entry.stored_at), Duration::from_secs(60));
    }
}
