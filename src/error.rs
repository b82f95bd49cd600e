//! Error types shared by every tier of the cache.

use thiserror::Error;

/// Errors surfaced to callers of [`crate::CacheFacade`] and its tiers.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The configured [`crate::codec::Codec`] failed to serialize a value.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The configured [`crate::codec::Codec`] failed to deserialize stored bytes.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A filesystem operation (sidecar read/write, directory setup) failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The manifest database failed to open, migrate, or execute a statement.
    #[error("store error: {0}")]
    Store(String),

    /// The key, once encoded, was not usable (e.g. empty).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The caller's await was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Store(e.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type CacheResult<T> = Result<T, CacheError>;
