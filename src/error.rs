//! Error types for the Gatekeeper admission-control core.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// The storage backend failed an I/O operation (connection refused,
    /// command failure, connection dropped mid-flight).
    #[error("Storage backend unavailable: {0}")]
    StorageUnavailable(String),

    /// A bounded wait on a storage operation elapsed.
    #[error("Storage operation timed out after {elapsed_ms}ms")]
    StorageTimeout { elapsed_ms: u64 },

    /// A stored value could not be converted to the requested type.
    #[error("Failed to decode stored value: {0}")]
    Decode(String),

    /// Configuration-related errors. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for GatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        // Client-side conversion failures, and the server's "value is not
        // an integer" reply to INCR, are both decode problems with the
        // stored value rather than an outage.
        let message = err.to_string();
        if err.kind() == redis::ErrorKind::TypeError || message.contains("not an integer") {
            GatekeeperError::Decode(message)
        } else {
            GatekeeperError::StorageUnavailable(message)
        }
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
