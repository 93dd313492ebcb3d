//! Typed errors for the guard library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`KeyValueStore`](crate::store::KeyValueStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached or refused the command
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Key holds a value of a different type than the command expects
    #[error("wrong value type at key {key}")]
    WrongType { key: String },

    /// Key pattern is not a valid glob
    #[error("invalid key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the guard primitives themselves.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The key has used up its slots in the current window
    #[error("rate limit exceeded for {key}")]
    RateLimited { key: String },

    /// Waiting was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Waiting for a slot took longer than allowed
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Invalid argument (zero limit, zero chunk size, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Backing store failed and the failure policy did not absorb it
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for guard operations.
pub type GuardResult<T> = std::result::Result<T, GuardError>;
