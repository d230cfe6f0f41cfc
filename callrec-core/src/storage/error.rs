use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by an [`ObjectStore`](super::ObjectStore) implementation.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The requested object was not found (HTTP 404).
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Access denied (HTTP 403).
    #[error("access denied to bucket '{bucket}'")]
    AccessDenied { bucket: String },

    /// The service asked us to slow down or is temporarily unavailable (HTTP 429/5xx).
    #[error("store throttled or unavailable: {0}")]
    Throttled(String),

    /// Failed to reach the endpoint (I/O or timeout while dispatching).
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// A local file involved in an upload could not be read.
    #[error("io error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Invalid or unsupported configuration (bad presign TTL, bad tag set).
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Catch-all for other store errors.
    #[error("store error: {0}")]
    S3Error(String),
}

impl StorageError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::ConnectionError(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
