//! Redis storage backend.
//!
//! Expiry and per-key atomicity are Redis's responsibility; this module
//! only maps the capability set onto commands. Every command runs under a
//! bounded per-operation timeout, and every failure surfaces as an explicit
//! error so callers can tell "key absent" from "backend down".

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::trace;

use super::StorageBackend;
use crate::config::RedisConfig;
use crate::error::{GatekeeperError, Result};

/// [`StorageBackend`] over a shared Redis instance.
pub struct RedisStore {
    client: redis::Client,
    op_timeout: Duration,
}

impl RedisStore {
    /// Create a store from connection settings. Fails fast on a malformed
    /// address; the first connection is only opened on first use.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let url = match &config.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, config.host, config.port, config.database
            ),
            None => format!("redis://{}:{}/{}", config.host, config.port, config.database),
        };
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            op_timeout: Duration::from_millis(config.operation_timeout_ms),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.bounded(self.client.get_multiplexed_async_connection())
            .await
    }

    /// Run a Redis future under the per-operation timeout.
    async fn bounded<T>(&self, fut: impl Future<Output = redis::RedisResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(GatekeeperError::from),
            Err(_) => Err(GatekeeperError::StorageTimeout {
                elapsed_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }
}

/// Whole seconds for a TTL, rounded up so short TTLs never truncate to 0.
fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[async_trait]
impl StorageBackend for RedisStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.connection().await?;
        match ttl.filter(|t| !t.is_zero()) {
            Some(ttl) => {
                let _: () = self
                    .bounded(conn.set_ex(key, value, ttl_seconds(ttl)))
                    .await?;
            }
            None => {
                let _: () = self.bounded(conn.set(key, value)).await?;
            }
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = self.bounded(conn.get(key)).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let exists: bool = self.bounded(conn.exists(key)).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = self.bounded(conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn keys_by_pattern(&self, pattern: &str) -> Result<HashSet<String>> {
        let mut conn = self.connection().await?;
        // Redis matches the same anchored glob server-side.
        let keys: Vec<String> = self.bounded(conn.keys(pattern)).await?;
        Ok(keys.into_iter().collect())
    }

    async fn increment_with_ttl(&self, key: &str, delta: i64, ttl_if_new: Duration) -> Result<i64> {
        let mut conn = self.connection().await?;
        let ttl = ttl_seconds(ttl_if_new);

        let incremented: Result<i64> = self.bounded(conn.incr(key, delta)).await;
        let value = match incremented {
            Ok(value) => value,
            Err(GatekeeperError::Decode(_)) => {
                // Non-numeric previous value counts as a 0 baseline:
                // overwrite with a fresh counter and its TTL.
                let _: () = self.bounded(conn.set_ex(key, delta, ttl)).await?;
                return Ok(delta);
            }
            Err(e) => return Err(e),
        };

        // A result equal to the delta means INCRBY created the key, and
        // only then does the TTL get set. Later increments never touch it.
        if value == delta {
            let _: bool = self.bounded(conn.expire(key, ttl as i64)).await?;
        }

        trace!(key = %key, value = value, "Incremented counter");
        Ok(value)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        // TTL already reports -1 for "no expiry" and -2 for "absent"
        let ttl: i64 = self.bounded(conn.ttl(key)).await?;
        Ok(ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{TTL_MISSING, TTL_NONE};

    #[test]
    fn test_store_creation() {
        let store = RedisStore::new(&RedisConfig::default());
        assert!(store.is_ok());
    }

    #[test]
    fn test_ttl_seconds_rounds_up() {
        assert_eq!(ttl_seconds(Duration::from_secs(60)), 60);
        assert_eq!(ttl_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
    }

    fn test_store() -> RedisStore {
        RedisStore::new(&RedisConfig::default()).unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_put_get_ttl_roundtrip() {
        let store = test_store();
        store
            .put("gatekeeper:test:k", "v", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(
            store.get("gatekeeper:test:k").await.unwrap(),
            Some("v".to_string())
        );
        let ttl = store.remaining_ttl("gatekeeper:test:k").await.unwrap();
        assert!(ttl > 0 && ttl <= 5);
        store.delete("gatekeeper:test:k").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_increment_sets_ttl_once() {
        let store = test_store();
        store.delete("gatekeeper:test:c").await.unwrap();

        let window = Duration::from_secs(60);
        assert_eq!(
            store
                .increment_with_ttl("gatekeeper:test:c", 1, window)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .increment_with_ttl("gatekeeper:test:c", 4, window)
                .await
                .unwrap(),
            5
        );
        let ttl = store.remaining_ttl("gatekeeper:test:c").await.unwrap();
        assert!(ttl > 0 && ttl <= 60);
        store.delete("gatekeeper:test:c").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_ttl_sentinels() {
        let store = test_store();
        store.put("gatekeeper:test:forever", "v", None).await.unwrap();
        assert_eq!(
            store.remaining_ttl("gatekeeper:test:forever").await.unwrap(),
            TTL_NONE
        );
        assert_eq!(
            store.remaining_ttl("gatekeeper:test:absent").await.unwrap(),
            TTL_MISSING
        );
        store.delete("gatekeeper:test:forever").await.unwrap();
    }
}
