//! TTL cache with an injectable clock.
//!
//! Expiry is evaluated against [`Clock::now`] on access; nothing is evicted in
//! the background. Callers schedule [`TtlCache::purge_expired`] themselves.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A cached value with its insertion time.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: DateTime<Utc>,
}

/// Map of key to value with a fixed time-to-live.
pub struct TtlCache<K, V> {
    entries: Arc<RwLock<HashMap<K, CacheEntry<V>>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_live(&self, entry: &CacheEntry<V>, now: DateTime<Utc>) -> bool {
        now - entry.inserted_at < self.ttl
    }

    /// Inserts `value` unless a live entry exists for `key`.
    ///
    /// An expired entry is replaced. On conflict the existing live entry is
    /// returned unchanged.
    pub async fn insert_if_vacant(&self, key: K, value: V) -> Result<(), CacheEntry<V>> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&key) {
            if self.is_live(existing, now) {
                return Err(existing.clone());
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
        Ok(())
    }

    /// Inserts or replaces `value`, resetting its age.
    pub async fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        self.entries.write().await.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
    }

    /// Modifies a live entry in place without resetting its age.
    pub async fn update<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if now - entry.inserted_at < self.ttl => {
                f(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    /// Returns the live entry for `key`.
    pub async fn get(&self, key: &K) -> Option<CacheEntry<V>> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .get(key)
            .filter(|entry| self.is_live(entry, now))
            .cloned()
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.get(key).await.is_some()
    }

    /// Removes and returns the entry for `key`, live or expired.
    pub async fn remove(&self, key: &K) -> Option<CacheEntry<V>> {
        self.entries.write().await.remove(key)
    }

    /// Drops every expired entry and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now - entry.inserted_at < self.ttl);
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
