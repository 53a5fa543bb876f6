//! Pluggable key-value/counter storage.
//!
//! The blacklist registry and rate limiter are written against the
//! [`StorageBackend`] trait; whether the state lives in-process or in a
//! shared Redis instance is a deployment-time decision made once in
//! [`from_config`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{StorageConfig, StorageMode};
use crate::error::Result;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Remaining-TTL sentinel: the key exists but has no expiry.
pub const TTL_NONE: i64 = -1;
/// Remaining-TTL sentinel: the key is absent or expired.
pub const TTL_MISSING: i64 = -2;

/// Capability interface over key/value and atomic counter operations.
///
/// Both implementations honor the same contract, so callers never know
/// which backend they are talking to:
/// - expired entries are never visible to reads, even before they are
///   physically removed
/// - `increment_with_ttl` is atomic per key under concurrent callers, and
///   the TTL it sets on counter creation is never reset by later increments
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store a value, overwriting unconditionally. A `ttl` of `None` means
    /// the entry never expires.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Fetch a value. Returns `None` for absent or expired keys.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Whether a live (non-expired) entry exists for the key.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove a key. Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Return all live keys matching a glob pattern, where `*` matches zero
    /// or more characters and the pattern is anchored at both ends.
    async fn keys_by_pattern(&self, pattern: &str) -> Result<HashSet<String>>;

    /// Add `delta` to a counter and return the new value.
    ///
    /// If the key was absent (or held a non-numeric value, which counts as
    /// a 0 baseline), the counter is created and `ttl_if_new` is set
    /// atomically with the write. The TTL of an existing, still-live
    /// counter is left untouched.
    async fn increment_with_ttl(&self, key: &str, delta: i64, ttl_if_new: Duration) -> Result<i64>;

    /// Seconds until the key expires, [`TTL_NONE`] if it has no expiry, or
    /// [`TTL_MISSING`] if it is absent or already expired.
    async fn remaining_ttl(&self, key: &str) -> Result<i64>;
}

/// Build the storage backend selected by the deployment configuration.
pub async fn from_config(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.mode {
        StorageMode::Memory => Ok(Arc::new(MemoryStore::new(Duration::from_secs(
            config.sweep_interval_secs,
        )))),
        StorageMode::Redis => Ok(Arc::new(RedisStore::new(&config.redis)?)),
    }
}
