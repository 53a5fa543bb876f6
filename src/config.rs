//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};

/// Main configuration for the Gatekeeper admission-control core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Admission check configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Per-dimension rate limits
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
}

/// Which storage backend to use. Chosen once at startup; there is no
/// runtime switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// In-process TTL cache
    Memory,
    /// Shared Redis instance
    Redis,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default = "default_storage_mode")]
    pub mode: StorageMode,

    /// Interval between background sweeps of expired entries (memory backend)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Redis connection settings (redis backend)
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: default_storage_mode(),
            sweep_interval_secs: default_sweep_interval(),
            redis: RedisConfig::default(),
        }
    }
}

fn default_storage_mode() -> StorageMode {
    StorageMode::Memory
}

fn default_sweep_interval() -> u64 {
    300
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub database: i64,

    /// Upper bound on any single Redis command, in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            database: 0,
            operation_timeout_ms: default_operation_timeout(),
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_operation_timeout() -> u64 {
    3000
}

/// Configuration for the per-request admission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Overall deadline for the blacklist + rate-limit evaluation, in
    /// milliseconds. Checks that outlive it are abandoned and the request
    /// is allowed.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Whether to evaluate blacklist membership
    #[serde(default = "default_true")]
    pub enable_blacklist: bool,

    /// Whether to evaluate rate limits
    #[serde(default = "default_true")]
    pub enable_rate_limit: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            enable_blacklist: true,
            enable_rate_limit: true,
        }
    }
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// Per-dimension rate limit settings, all sharing one fixed window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_ip_max")]
    pub ip_max_requests: i64,

    #[serde(default = "default_user_max")]
    pub user_max_requests: i64,

    #[serde(default = "default_api_key_max")]
    pub api_key_max_requests: i64,

    #[serde(default = "default_endpoint_max")]
    pub endpoint_max_requests: i64,

    /// Fixed window length in seconds
    #[serde(default = "default_window")]
    pub window_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            ip_max_requests: default_ip_max(),
            user_max_requests: default_user_max(),
            api_key_max_requests: default_api_key_max(),
            endpoint_max_requests: default_endpoint_max(),
            window_seconds: default_window(),
        }
    }
}

fn default_ip_max() -> i64 {
    1000
}

fn default_user_max() -> i64 {
    500
}

fn default_api_key_max() -> i64 {
    1000
}

fn default_endpoint_max() -> i64 {
    100
}

fn default_window() -> u64 {
    60
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatekeeperConfig = serde_yaml::from_str(&contents)
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Serving traffic under invalid limits is
    /// worse than refusing to start, so any violation is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.storage.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "storage.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.storage.redis.operation_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "storage.redis.operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.admission.timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "admission.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.rate_limits.window_seconds == 0 {
            return Err(GatekeeperError::Config(
                "rate_limits.window_seconds must be greater than zero".to_string(),
            ));
        }
        let limits = [
            ("ip_max_requests", self.rate_limits.ip_max_requests),
            ("user_max_requests", self.rate_limits.user_max_requests),
            ("api_key_max_requests", self.rate_limits.api_key_max_requests),
            ("endpoint_max_requests", self.rate_limits.endpoint_max_requests),
        ];
        for (name, value) in limits {
            if value <= 0 {
                return Err(GatekeeperError::Config(format!(
                    "rate_limits.{} must be greater than zero, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}
