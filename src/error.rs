//! Error types for the Ratewarden service.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`CounterStore`](crate::store::CounterStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The caller cancelled the operation before it completed.
    #[error("store operation cancelled")]
    Cancelled,

    /// The caller's deadline passed before the operation completed.
    #[error("store operation exceeded the caller deadline")]
    DeadlineExceeded,

    /// The backend did not answer within its own response timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Redis command or connection failure.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// A decision could not be made because a store operation failed.
///
/// Each variant names the step of the decision that failed. None of them
/// imply an allow or a deny.
#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("failed to check block state for {key}: {source}")]
    BlockCheck {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to increment counter for {key}: {source}")]
    Increment {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to block {key}: {source}")]
    SetBlock {
        key: String,
        #[source]
        source: StoreError,
    },
}

impl DecisionError {
    /// The identity key the failed operation was working on.
    pub fn key(&self) -> &str {
        match self {
            DecisionError::BlockCheck { key, .. }
            | DecisionError::Increment { key, .. }
            | DecisionError::SetBlock { key, .. } => key,
        }
    }
}

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from the layered configuration loader
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Storage backend errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
