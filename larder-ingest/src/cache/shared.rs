//! Shared (long-lived) cache tier
//!
//! In a multi-process deployment this is a network-visible store so a hit
//! computed by one worker is seen by all of them.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::CacheEntry;
use larder_common::Result;

/// Backing store for the long-lived cache tier
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Fetch an entry; expired entries may be returned and are filtered by the caller
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or replace an entry
    async fn set(&self, entry: CacheEntry) -> Result<()>;

    /// Delete keys starting with `prefix`, returning the deleted keys
    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete keys tagged with `tag`, returning the deleted keys
    async fn delete_tag(&self, tag: &str) -> Result<Vec<String>>;

    /// Delete expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<u64>;

    /// Number of unexpired entries
    async fn len(&self) -> Result<u64>;
}

/// In-process shared tier for tests and single-process deployments
#[derive(Default)]
pub struct MemorySharedStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn delete_where<P>(&self, predicate: P) -> Vec<String>
    where
        P: Fn(&CacheEntry) -> bool,
    {
        let mut entries = self.entries.write().await;
        let keys: Vec<String> = entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &keys {
            entries.remove(key);
        }
        keys
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        self.entries.write().await.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.delete_where(|entry| entry.key.starts_with(prefix)).await)
    }

    async fn delete_tag(&self, tag: &str) -> Result<Vec<String>> {
        Ok(self.delete_where(|entry| entry.tags.contains(tag)).await)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        Ok(self.delete_where(|entry| entry.is_expired(now)).await.len() as u64)
    }

    async fn len(&self) -> Result<u64> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        Ok(entries.values().filter(|e| !e.is_expired(now)).count() as u64)
    }
}
