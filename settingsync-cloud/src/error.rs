//! Cloud sync error types.

use thiserror::Error;

/// Result type for cloud sync operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors that can occur in cloud sync operations.
#[derive(Debug, Error)]
pub enum CloudError {
    /// A required collaborator was not wired in. Static misconfiguration.
    #[error("cloud sync {0} not configured")]
    NotConfigured(&'static str),

    #[error("device id unavailable: {0}")]
    DeviceIdUnavailable(String),

    #[error("no sync key available on this device")]
    KeyNotFound,

    #[error("cloud sync key version {0} not found")]
    KeyVersionNotFound(i32),

    #[error("relay request failed ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] settingsync_crypto::CryptoError),

    #[error("storage error: {0}")]
    Storage(#[from] settingsync_storage::StorageError),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("oplog error: {0}")]
    Oplog(String),

    #[error("apply error: {0}")]
    Apply(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CloudError {
    /// True for failures caused by wiring rather than by the network or data.
    pub fn is_configuration(&self) -> bool {
        matches!(self, CloudError::NotConfigured(_) | CloudError::Config(_))
    }

    /// HTTP status for relay errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            CloudError::Api { status, .. } => Some(*status),
            CloudError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
