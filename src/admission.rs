//! Per-request admission control.
//!
//! For each request the controller evaluates deny-list membership and rate
//! quotas concurrently under one overall deadline, then renders a final
//! ALLOW or BLOCK. The failure policy is fail-open and lives in a single
//! pure function: a slow or unhealthy storage backend must never take the
//! protected service down with it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, warn};

use crate::blacklist::BlacklistRegistry;
use crate::config::AdmissionConfig;
use crate::error::Result;
use crate::ratelimit::{RateLimitResult, RateLimiter};

/// Caller identity extracted by the request pipeline.
///
/// `client_ip` and `endpoint` are always present; `user_id` and `api_key`
/// are opaque header values that may be missing.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub client_ip: String,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub endpoint: String,
}

/// Why a request was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Blacklisted,
    RateLimited,
}

impl DenyReason {
    /// Machine code for the deny payload.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::Blacklisted => "BLACKLISTED",
            DenyReason::RateLimited => "RATE_LIMITED",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DenyReason::Blacklisted => 403,
            DenyReason::RateLimited => 429,
        }
    }

    fn status_phrase(&self) -> &'static str {
        match self {
            DenyReason::Blacklisted => "Forbidden",
            DenyReason::RateLimited => "Too Many Requests",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            DenyReason::Blacklisted => "Your request has been blocked",
            DenyReason::RateLimited => "Rate limit exceeded",
        }
    }
}

/// Final decision for one request.
///
/// `remaining` and `reset_seconds` are informational even on ALLOW; the
/// pipeline exposes them as `X-RateLimit-Remaining` / `X-RateLimit-Reset`
/// and, on a rate-limited BLOCK, `Retry-After`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allow: bool,
    pub reason: Option<DenyReason>,
    pub remaining: i64,
    pub reset_seconds: i64,
}

impl AdmissionDecision {
    fn allow(remaining: i64, reset_seconds: i64) -> Self {
        Self {
            allow: true,
            reason: None,
            remaining,
            reset_seconds,
        }
    }

    fn block(reason: DenyReason, remaining: i64, reset_seconds: i64) -> Self {
        Self {
            allow: false,
            reason: Some(reason),
            remaining,
            reset_seconds,
        }
    }

    /// ALLOW with no quota information, used when evaluation failed or the
    /// deadline elapsed.
    fn fail_open() -> Self {
        Self::allow(i64::MAX, -1)
    }

    /// The deny payload the pipeline must emit verbatim on BLOCK.
    pub fn deny_payload(&self) -> Option<DenyPayload> {
        if self.allow {
            None
        } else {
            Some(DenyPayload::for_reason(self.reason))
        }
    }
}

/// Structured JSON body for blocked requests.
#[derive(Debug, Clone, Serialize)]
pub struct DenyPayload {
    /// HTTP status phrase
    pub error: String,
    /// Human-readable explanation
    pub message: String,
    /// Machine code: BLACKLISTED, RATE_LIMITED, or ACCESS_DENIED
    pub code: String,
    /// ISO-8601 timestamp
    pub timestamp: String,
}

impl DenyPayload {
    /// Render the payload for a deny reason. `None` falls back to the
    /// generic ACCESS_DENIED shape reserved for future reasons.
    pub fn for_reason(reason: Option<DenyReason>) -> Self {
        let (error, message, code) = match reason {
            Some(reason) => (reason.status_phrase(), reason.message(), reason.code()),
            None => ("Forbidden", "Access denied", "ACCESS_DENIED"),
        };
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code: code.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }
}

/// Orchestrates blacklist and rate-limit evaluation for each request.
///
/// A request moves from received, through the two parallel checks, to a
/// terminal decision; any error or deadline expiry along the way forces
/// the decision to ALLOW.
pub struct AdmissionController {
    blacklist: Arc<BlacklistRegistry>,
    rate_limiter: Arc<RateLimiter>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(
        blacklist: Arc<BlacklistRegistry>,
        rate_limiter: Arc<RateLimiter>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            blacklist,
            rate_limiter,
            config,
        }
    }

    /// Decide admission for one request. Never fails: infrastructure
    /// problems are converted to ALLOW and logged, so the only BLOCK
    /// reasons a caller can observe are the two deliberate ones.
    pub async fn check(&self, identity: &RequestIdentity) -> AdmissionDecision {
        let blacklist_check = async {
            if self.config.enable_blacklist {
                self.blacklist
                    .is_any_blacklisted(
                        Some(&identity.client_ip),
                        identity.user_id.as_deref(),
                        identity.api_key.as_deref(),
                    )
                    .await
            } else {
                Ok(false)
            }
        };
        let rate_limit_check = async {
            if self.config.enable_rate_limit {
                self.rate_limiter
                    .check_multiple(
                        Some(&identity.client_ip),
                        identity.user_id.as_deref(),
                        identity.api_key.as_deref(),
                        Some(&identity.endpoint),
                    )
                    .await
            } else {
                Ok(RateLimitResult::unlimited())
            }
        };

        let deadline = Duration::from_millis(self.config.timeout_ms);
        // Late results from checks abandoned at the deadline are simply
        // discarded along with the joined future.
        let outcome = tokio::time::timeout(
            deadline,
            futures::future::join(blacklist_check, rate_limit_check),
        )
        .await
        .ok();

        match &outcome {
            None => error!(
                ip = %identity.client_ip,
                user_id = ?identity.user_id,
                api_key = %redact_api_key(identity.api_key.as_deref()),
                timeout_ms = self.config.timeout_ms,
                "Admission check timed out - allowing request"
            ),
            Some((Err(e), _)) => error!(
                ip = %identity.client_ip,
                user_id = ?identity.user_id,
                api_key = %redact_api_key(identity.api_key.as_deref()),
                error = %e,
                "Blacklist check failed - allowing request"
            ),
            Some((_, Err(e))) => error!(
                ip = %identity.client_ip,
                user_id = ?identity.user_id,
                api_key = %redact_api_key(identity.api_key.as_deref()),
                error = %e,
                "Rate limit check failed - allowing request"
            ),
            Some((Ok(_), Ok(_))) => {}
        }

        let decision = resolve(outcome);
        if let Some(reason) = decision.reason {
            warn!(
                ip = %identity.client_ip,
                user_id = ?identity.user_id,
                api_key = %redact_api_key(identity.api_key.as_deref()),
                reason = reason.code(),
                "Blocked request"
            );
        }
        decision
    }
}

/// The whole failure-vs-decision policy in one place.
///
/// `None` means the deadline elapsed before both checks completed. Anything
/// short of two clean results yields ALLOW; otherwise blacklisting takes
/// precedence over the rate limit.
fn resolve(outcome: Option<(Result<bool>, Result<RateLimitResult>)>) -> AdmissionDecision {
    match outcome {
        Some((Ok(true), Ok(rate))) => {
            AdmissionDecision::block(DenyReason::Blacklisted, rate.remaining, rate.reset_seconds)
        }
        Some((Ok(false), Ok(rate))) if !rate.allowed => {
            AdmissionDecision::block(DenyReason::RateLimited, rate.remaining, rate.reset_seconds)
        }
        Some((Ok(false), Ok(rate))) => AdmissionDecision::allow(rate.remaining, rate.reset_seconds),
        _ => AdmissionDecision::fail_open(),
    }
}

/// Reveal only a short prefix of an API key for log lines.
fn redact_api_key(api_key: Option<&str>) -> String {
    match api_key {
        Some(key) => format!("{}***", key.chars().take(8).collect::<String>()),
        None => "-".to_string(),
    }
}
