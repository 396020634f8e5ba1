//! Error types for cirrus-vmm.

use thiserror::Error;

/// Result type alias for cirrus-vmm operations.
pub type Result<T> = std::result::Result<T, VmmError>;

/// Errors that can occur while talking to a VMM.
#[derive(Debug, Error)]
pub enum VmmError {
    /// Payload configuration is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Request could not be delivered over the control socket
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    /// VMM answered with a non-success status
    #[error("{endpoint} returned status {status}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Request did not complete in time
    #[error("{endpoint} timed out after {timeout:?}")]
    Timeout {
        endpoint: String,
        timeout: std::time::Duration,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
