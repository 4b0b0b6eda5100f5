//! Side-store error types

use thiserror::Error;

/// Errors that can occur during side-store operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Failed to connect to the side-store backend
    #[error("Cache connection error: {0}")]
    ConnectionError(String),

    /// Failed to serialize or deserialize a stored value
    #[error("Cache serialization error: {0}")]
    SerializationError(String),

    /// Side-store operation timed out
    #[error("Cache operation timed out: {0}")]
    Timeout(String),

    /// Generic backend error
    #[error("Cache backend error: {0}")]
    BackendError(String),

    /// Backend selection or settings are unusable
    #[error("Cache configuration error: {0}")]
    Configuration(String),
}

/// Result type for side-store operations
pub type CacheResult<T> = Result<T, CacheError>;
