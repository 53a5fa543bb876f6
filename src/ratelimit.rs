//! Fixed-window rate limiting per identity dimension.
//!
//! Window model is deliberately fixed-window: the counter for a key lives
//! for one window and fully resets when it expires, so a caller near a
//! window boundary can see up to twice the nominal rate across two
//! consecutive windows. That tradeoff buys one atomic increment per check
//! instead of per-request bookkeeping.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::RateLimitSettings;
use crate::error::{GatekeeperError, Result};
use crate::storage::StorageBackend;

/// Outcome of a rate limit check.
///
/// `remaining` and `reset_seconds` are informational even when the request
/// is allowed; the request pipeline forwards them as response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_seconds: i64,
}

impl RateLimitResult {
    pub fn allowed(remaining: i64, reset_seconds: i64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_seconds,
        }
    }

    pub fn exceeded(remaining: i64, reset_seconds: i64) -> Self {
        Self {
            allowed: false,
            remaining,
            reset_seconds,
        }
    }

    /// Sentinel for "no limit applies".
    pub fn unlimited() -> Self {
        Self::allowed(i64::MAX, -1)
    }
}

/// Identity dimension a rate limit window is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitDimension {
    Ip,
    User,
    ApiKey,
    Endpoint,
}

impl RateLimitDimension {
    fn key_prefix(&self) -> &'static str {
        match self {
            RateLimitDimension::Ip => "rate_limit:ip:",
            RateLimitDimension::User => "rate_limit:user:",
            RateLimitDimension::ApiKey => "rate_limit:api_key:",
            RateLimitDimension::Endpoint => "rate_limit:endpoint:",
        }
    }
}

impl fmt::Display for RateLimitDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitDimension::Ip => write!(f, "ip"),
            RateLimitDimension::User => write!(f, "user"),
            RateLimitDimension::ApiKey => write!(f, "api_key"),
            RateLimitDimension::Endpoint => write!(f, "endpoint"),
        }
    }
}

/// Fixed-window rate limiter over [`StorageBackend`] counters.
pub struct RateLimiter {
    store: Arc<dyn StorageBackend>,
    settings: RwLock<RateLimitSettings>,
}

impl RateLimiter {
    /// Create a limiter with default per-dimension limits.
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        Self::with_settings(store, RateLimitSettings::default())
    }

    pub fn with_settings(store: Arc<dyn StorageBackend>, settings: RateLimitSettings) -> Self {
        Self {
            store,
            settings: RwLock::new(settings),
        }
    }

    /// Replace the per-dimension limits. Existing windows keep counting
    /// against the new maximums.
    pub fn set_settings(&self, settings: RateLimitSettings) {
        let mut current = self.settings.write();
        *current = settings;
    }

    /// Get the current per-dimension limits.
    pub fn settings(&self) -> RateLimitSettings {
        self.settings.read().clone()
    }

    /// Check one dimension's window, consuming quota.
    ///
    /// The counter is incremented before the limit comparison, so a
    /// rejected request still counts against the window; there is no
    /// refund on rejection.
    pub async fn check_dimension(
        &self,
        dimension: RateLimitDimension,
        identifier: &str,
        max_requests: i64,
        window: Duration,
    ) -> Result<RateLimitResult> {
        let key = format!("{}{}", dimension.key_prefix(), identifier);

        let current = match self.store.increment_with_ttl(&key, 1, window).await {
            Ok(count) => count,
            // An undecodable counter restarts as a baseline of this one
            // request rather than failing the check.
            Err(GatekeeperError::Decode(_)) => 1,
            Err(e) => return Err(e),
        };
        let remaining = (max_requests - current).max(0);
        let reset_seconds = self.store.remaining_ttl(&key).await?;

        trace!(
            key = %key,
            count = current,
            max = max_requests,
            "Checked rate limit window"
        );

        if current > max_requests {
            debug!(key = %key, count = current, max = max_requests, "Rate limit exceeded");
            Ok(RateLimitResult::exceeded(remaining, reset_seconds))
        } else {
            Ok(RateLimitResult::allowed(remaining, reset_seconds))
        }
    }

    /// Check the per-IP window with the configured limits.
    pub async fn check_ip(&self, ip: &str) -> Result<RateLimitResult> {
        let settings = self.settings();
        self.check_dimension(
            RateLimitDimension::Ip,
            ip,
            settings.ip_max_requests,
            Duration::from_secs(settings.window_seconds),
        )
        .await
    }

    /// Check the per-user window with the configured limits.
    pub async fn check_user(&self, user_id: &str) -> Result<RateLimitResult> {
        let settings = self.settings();
        self.check_dimension(
            RateLimitDimension::User,
            user_id,
            settings.user_max_requests,
            Duration::from_secs(settings.window_seconds),
        )
        .await
    }

    /// Check the per-API-key window with the configured limits.
    pub async fn check_api_key(&self, api_key: &str) -> Result<RateLimitResult> {
        let settings = self.settings();
        self.check_dimension(
            RateLimitDimension::ApiKey,
            api_key,
            settings.api_key_max_requests,
            Duration::from_secs(settings.window_seconds),
        )
        .await
    }

    /// Check the per-endpoint window for one caller identity.
    pub async fn check_endpoint(&self, endpoint: &str, identifier: &str) -> Result<RateLimitResult> {
        let settings = self.settings();
        self.check_dimension(
            RateLimitDimension::Endpoint,
            &format!("{}:{}", endpoint, identifier),
            settings.endpoint_max_requests,
            Duration::from_secs(settings.window_seconds),
        )
        .await
    }

    /// Check every applicable dimension concurrently and return the
    /// tightest result (smallest `remaining`; ties are unspecified).
    ///
    /// The endpoint check is keyed by the most specific present identity:
    /// user id, then API key, then IP, else `"anonymous"`. When no
    /// dimension applies the result is [`RateLimitResult::unlimited`].
    pub async fn check_multiple(
        &self,
        ip: Option<&str>,
        user_id: Option<&str>,
        api_key: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<RateLimitResult> {
        let settings = self.settings();
        let window = Duration::from_secs(settings.window_seconds);

        let endpoint_identifier = endpoint.map(|endpoint| {
            let identity = user_id.or(api_key).or(ip).unwrap_or("anonymous");
            format!("{}:{}", endpoint, identity)
        });

        let mut checks = Vec::new();
        if let Some(ip) = ip {
            checks.push(self.check_dimension(
                RateLimitDimension::Ip,
                ip,
                settings.ip_max_requests,
                window,
            ));
        }
        if let Some(user_id) = user_id {
            checks.push(self.check_dimension(
                RateLimitDimension::User,
                user_id,
                settings.user_max_requests,
                window,
            ));
        }
        if let Some(api_key) = api_key {
            checks.push(self.check_dimension(
                RateLimitDimension::ApiKey,
                api_key,
                settings.api_key_max_requests,
                window,
            ));
        }
        if let Some(identifier) = endpoint_identifier.as_deref() {
            checks.push(self.check_dimension(
                RateLimitDimension::Endpoint,
                identifier,
                settings.endpoint_max_requests,
                window,
            ));
        }

        if checks.is_empty() {
            return Ok(RateLimitResult::unlimited());
        }

        let mut tightest: Option<RateLimitResult> = None;
        for result in join_all(checks).await {
            let result = result?;
            if tightest.map_or(true, |current| result.remaining < current.remaining) {
                tightest = Some(result);
            }
        }
        Ok(tightest.unwrap_or_else(RateLimitResult::unlimited))
    }
}
