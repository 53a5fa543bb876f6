//! Deny-list registry over independent identity dimensions.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::debug;

use crate::error::Result;
use crate::storage::StorageBackend;

/// Identity dimension a deny-list entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Ip,
    User,
    ApiKey,
}

impl Dimension {
    fn key_prefix(&self) -> &'static str {
        match self {
            Dimension::Ip => "blacklist:ip:",
            Dimension::User => "blacklist:user:",
            Dimension::ApiKey => "blacklist:api_key:",
        }
    }

    fn key(&self, value: &str) -> String {
        format!("{}{}", self.key_prefix(), value)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Ip => write!(f, "ip"),
            Dimension::User => write!(f, "user"),
            Dimension::ApiKey => write!(f, "api_key"),
        }
    }
}

/// Deny-list CRUD and membership checks, backed by [`StorageBackend`].
pub struct BlacklistRegistry {
    store: Arc<dyn StorageBackend>,
}

impl BlacklistRegistry {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        Self { store }
    }

    /// Add a value to the deny list. The reason is stored as-is for
    /// diagnostics and never interpreted. A `ttl` of `None` blacklists
    /// permanently.
    pub async fn add(
        &self,
        dimension: Dimension,
        value: &str,
        reason: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        debug!(dimension = %dimension, value = %value, "Adding blacklist entry");
        self.store.put(&dimension.key(value), reason, ttl).await
    }

    /// Whether a value is currently blacklisted in one dimension.
    pub async fn is_blacklisted(&self, dimension: Dimension, value: &str) -> Result<bool> {
        self.store.exists(&dimension.key(value)).await
    }

    /// Whether any of the supplied identity fields is blacklisted.
    ///
    /// All present fields are checked concurrently and every check runs to
    /// completion; an early `true` does not cancel the rest. Absent fields
    /// are never treated as blacklisted.
    pub async fn is_any_blacklisted(
        &self,
        ip: Option<&str>,
        user_id: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<bool> {
        let mut checks = Vec::new();
        if let Some(ip) = ip {
            checks.push(self.is_blacklisted(Dimension::Ip, ip));
        }
        if let Some(user_id) = user_id {
            checks.push(self.is_blacklisted(Dimension::User, user_id));
        }
        if let Some(api_key) = api_key {
            checks.push(self.is_blacklisted(Dimension::ApiKey, api_key));
        }
        if checks.is_empty() {
            return Ok(false);
        }

        let mut any = false;
        for result in join_all(checks).await {
            any |= result?;
        }
        Ok(any)
    }

    /// All blacklisted values in a dimension, for administrative inspection.
    pub async fn list_by_dimension(&self, dimension: Dimension) -> Result<HashSet<String>> {
        let prefix = dimension.key_prefix();
        let keys = self.store.keys_by_pattern(&format!("{}*", prefix)).await?;
        Ok(keys
            .into_iter()
            .map(|key| key.trim_start_matches(prefix).to_string())
            .collect())
    }
}
