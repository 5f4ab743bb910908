#![forbid(unsafe_code)]
//! Error types for the permafrost region cache.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace.

use thiserror::Error;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid cache configuration: {0}")]
    Configuration(String),

    #[error("cache resource already closed")]
    AlreadyClosed,

    #[error("population failed: {0}")]
    PopulateFailed(String),
}

/// Populate failures fan out to every waiter coalesced onto the same gap.
/// I/O errors clone as kind plus message.
impl Clone for CacheError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
            Self::Configuration(reason) => Self::Configuration(reason.clone()),
            Self::AlreadyClosed => Self::AlreadyClosed,
            Self::PopulateFailed(reason) => Self::PopulateFailed(reason.clone()),
        }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
