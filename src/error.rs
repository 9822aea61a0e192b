//! Error types for genproxy

use std::io;
use thiserror::Error;

/// Result type for genproxy operations
pub type Result<T> = std::result::Result<T, GenproxyError>;

/// Errors that can occur in genproxy
#[derive(Debug, Error)]
pub enum GenproxyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Forwarding to the real destination failed
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The storage backend could not serve a get/put
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// No recording exists for the fingerprint
    #[error("Recording not found for fingerprint {0}")]
    RecordingNotFound(String),

    /// Stored recording could not be decoded
    #[error("Invalid recording format: {0}")]
    InvalidFormat(String),

    /// Request/response too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Too many headers on a request
    #[error("Too many headers: {count} exceeds limit of {limit}")]
    TooManyHeaders {
        /// Header count
        count: usize,
        /// Header limit
        limit: usize,
    },

    /// Malformed request that cannot be proxied
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<redis::RedisError> for GenproxyError {
    fn from(e: redis::RedisError) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}
