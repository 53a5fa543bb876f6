//! In-process storage backend.
//!
//! Entries live in a concurrent map and expire lazily: a read that observes
//! an expired entry removes it (compare-and-remove, so a concurrently
//! refreshed entry survives) and reports the key absent. A background sweep
//! task bounds growth between reads.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{StorageBackend, TTL_MISSING, TTL_NONE};
use crate::error::{GatekeeperError, Result};

/// A single cached value with an optional absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.filter(|t| !t.is_zero()).map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }

    /// Counter reading of the value. Non-numeric contents are a 0 baseline,
    /// never an error.
    fn counter_value(&self) -> i64 {
        self.value.parse().unwrap_or(0)
    }
}

/// In-process [`StorageBackend`] over a concurrent map.
///
/// Must be created inside a Tokio runtime: the constructor spawns the
/// sweep task.
pub struct MemoryStore {
    cache: Arc<DashMap<String, CacheEntry>>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a new store and start its background sweep task.
    pub fn new(sweep_interval: Duration) -> Self {
        let cache: Arc<DashMap<String, CacheEntry>> = Arc::new(DashMap::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let sweep_cache = Arc::clone(&cache);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so sweeps
            // start one full interval after creation.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => sweep_expired(&sweep_cache),
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self {
            cache,
            shutdown_tx,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Stop the background sweep task and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Number of entries currently held, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Look up a live entry, removing it if it turns out to be expired.
    fn resolve(&self, key: &str) -> Option<CacheEntry> {
        let entry = match self.cache.get(key) {
            Some(entry) => entry.value().clone(),
            None => return None,
        };
        if entry.is_expired() {
            // Remove only if unchanged since we read it; a concurrent
            // writer may have refreshed the key in the meantime.
            self.cache.remove_if(key, |_, current| current == &entry);
            None
        } else {
            Some(entry)
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

/// Remove every entry whose expiry has passed, leaving concurrently
/// refreshed entries in place.
fn sweep_expired(cache: &DashMap<String, CacheEntry>) {
    let expired: Vec<(String, CacheEntry)> = cache
        .iter()
        .filter(|entry| entry.value().is_expired())
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();

    let mut removed = 0usize;
    for (key, observed) in expired {
        if cache
            .remove_if(&key, |_, current| current == &observed)
            .is_some()
        {
            removed += 1;
        }
    }

    if removed > 0 {
        debug!(removed = removed, "Swept expired cache entries");
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.cache
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.resolve(key).map(|entry| entry.value))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.resolve(key).is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.cache.remove(key).is_some())
    }

    async fn keys_by_pattern(&self, pattern: &str) -> Result<HashSet<String>> {
        let anchored = format!(
            "^{}$",
            pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*")
        );
        let matcher = regex::Regex::new(&anchored)
            .map_err(|e| GatekeeperError::Config(format!("Invalid key pattern {pattern}: {e}")))?;

        Ok(self
            .cache
            .iter()
            .filter(|entry| !entry.value().is_expired() && matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn increment_with_ttl(&self, key: &str, delta: i64, ttl_if_new: Duration) -> Result<i64> {
        // The entry API holds the key's shard lock, so read-modify-write
        // here is atomic with respect to other incrementers.
        let new_value = match self.cache.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    // An expired counter is as good as absent: fresh value,
                    // fresh TTL.
                    occupied.insert(CacheEntry::new(&delta.to_string(), Some(ttl_if_new)));
                    delta
                } else {
                    let next = occupied.get().counter_value() + delta;
                    let expires_at = occupied.get().expires_at;
                    occupied.insert(CacheEntry {
                        value: next.to_string(),
                        expires_at,
                    });
                    next
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(&delta.to_string(), Some(ttl_if_new)));
                delta
            }
        };

        trace!(key = %key, value = new_value, "Incremented counter");
        Ok(new_value)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<i64> {
        let entry = match self.resolve(key) {
            Some(entry) => entry,
            None => return Ok(TTL_MISSING),
        };
        let expires_at = match entry.expires_at {
            Some(at) => at,
            None => return Ok(TTL_NONE),
        };
        let left = expires_at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            self.cache.remove_if(key, |_, current| current == &entry);
            return Ok(TTL_MISSING);
        }
        // Round up: a key that still has 200ms to live reports 1 second,
        // never 0.
        let secs = left.as_secs();
        Ok(if left.subsec_nanos() > 0 {
            secs as i64 + 1
        } else {
            secs as i64
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        // Long interval so sweeps never interfere with lazy-expiry tests
        MemoryStore::new(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = store();
        store.put("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = store();
        assert_eq!(store.get("nope").await.unwrap(), None);
        assert!(!store.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = store();
        store.put("k", "old", None).await.unwrap();
        store.put("k", "new", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        store.put("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let store = store();
        store
            .put("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.remaining_ttl("k").await.unwrap(), TTL_MISSING);
    }

    #[tokio::test]
    async fn test_zero_ttl_means_no_expiry() {
        let store = store();
        store.put("k", "v", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(store.remaining_ttl("k").await.unwrap(), TTL_NONE);
    }

    #[tokio::test]
    async fn test_remaining_ttl_bounds() {
        let store = store();
        store
            .put("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        let ttl = store.remaining_ttl("k").await.unwrap();
        assert!(ttl > 0 && ttl <= 10, "ttl was {}", ttl);

        store.put("forever", "v", None).await.unwrap();
        assert_eq!(store.remaining_ttl("forever").await.unwrap(), TTL_NONE);
        assert_eq!(store.remaining_ttl("absent").await.unwrap(), TTL_MISSING);
    }

    #[tokio::test]
    async fn test_increment_sums_deltas() {
        let store = store();
        let window = Duration::from_secs(60);
        assert_eq!(store.increment_with_ttl("c", 1, window).await.unwrap(), 1);
        assert_eq!(store.increment_with_ttl("c", 2, window).await.unwrap(), 3);
        assert_eq!(store.increment_with_ttl("c", 5, window).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_increment_does_not_reset_ttl() {
        let store = store();
        store
            .increment_with_ttl("c", 1, Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // If this reset the TTL, the key would survive past 100ms
        store
            .increment_with_ttl("c", 1, Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_on_expired_counter_starts_fresh() {
        let store = store();
        store
            .increment_with_ttl("c", 5, Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let value = store
            .increment_with_ttl("c", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(value, 1);
        let ttl = store.remaining_ttl("c").await.unwrap();
        assert!(ttl > 0 && ttl <= 60);
    }

    #[tokio::test]
    async fn test_increment_non_numeric_baseline() {
        let store = store();
        store.put("c", "garbage", None).await.unwrap();
        let value = store
            .increment_with_ttl("c", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let store = Arc::new(store());
        let window = Duration::from_secs(60);

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.increment_with_ttl("c", 1, window).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.get("c").await.unwrap(), Some("100".to_string()));
        let ttl = store.remaining_ttl("c").await.unwrap();
        assert!(ttl > 0 && ttl <= 60, "ttl was reset: {}", ttl);
    }

    #[tokio::test]
    async fn test_keys_by_pattern_is_anchored() {
        let store = store();
        store.put("blacklist:ip:1.2.3.4", "x", None).await.unwrap();
        store.put("blacklist:ip:5.6.7.8", "x", None).await.unwrap();
        store.put("blacklist:user:42", "x", None).await.unwrap();
        store.put("rate_limit:ip:1.2.3.4", "x", None).await.unwrap();

        let keys = store.keys_by_pattern("blacklist:ip:*").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("blacklist:ip:1.2.3.4"));
        assert!(keys.contains("blacklist:ip:5.6.7.8"));

        // No implicit prefix/suffix wildcards
        let keys = store.keys_by_pattern("ip").await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_keys_by_pattern_skips_expired() {
        let store = store();
        store.put("blacklist:ip:live", "x", None).await.unwrap();
        store
            .put("blacklist:ip:dead", "x", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let keys = store.keys_by_pattern("blacklist:ip:*").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("blacklist:ip:live"));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let store = MemoryStore::new(Duration::from_millis(40));
        store
            .put("dead", "x", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.put("live", "x", None).await.unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_millis(120)).await;
        // The sweep ran without any read touching the expired key
        assert_eq!(store.len(), 1);
        assert!(store.exists("live").await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweep() {
        let store = MemoryStore::new(Duration::from_millis(30));
        store.shutdown().await;

        store
            .put("dead", "x", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // No sweep anymore; only a read would evict it now
        assert_eq!(store.len(), 1);
    }
}
