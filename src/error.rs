//! Error types for the vitae enhancement pipeline.

use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Corrupt record under key {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failure of a wrapped remote operation.
///
/// Variants carry the information the retry policy needs to classify them;
/// anything the caller cannot name precisely goes into `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Errors raised by the upstream job feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("Feed disconnected: {0}")]
    Disconnected(String),

    #[error("Feed subscription rejected: {0}")]
    Rejected(String),

    /// Low-level assertion failure inside the feed client. Repeated
    /// occurrences indicate infrastructure instability.
    #[error("Feed internal assertion failed: {0}")]
    Internal(String),
}

impl FeedError {
    pub fn is_internal(&self) -> bool {
        matches!(self, FeedError::Internal(_))
    }
}

/// Top-level API errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Feed error: {0}")]
    FeedError(#[from] FeedError),

    #[error("Operation failed: {0}")]
    OperationFailed(#[from] OperationError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}

pub(crate) fn sled_to_storage(err: sled::Error) -> StorageError {
    StorageError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        err.to_string(),
    ))
}

pub(crate) fn json_to_storage(key: &str, err: serde_json::Error) -> StorageError {
    StorageError::CorruptRecord {
        key: key.to_string(),
        reason: err.to_string(),
    }
}
