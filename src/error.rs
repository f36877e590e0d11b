/// Unified error types for the store
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Bad arguments: unknown account name, duplicate subscribe/block,
    /// unknown sort type, malformed import blob
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation conflicts with existing state (duplicate name, id mismatch)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The store (or the account) has not finished initializing
    #[error("Not ready: {0}")]
    NotReady(String),

    /// A previous operation on the same session has not resolved yet
    /// (e.g. loadMore called again before the window grew)
    #[error("Operation pending: {0}")]
    PendingOperation(String),

    /// Content or page fetch failed; recorded per entity, never fatal to
    /// the surrounding merge
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Durable storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A fetch or update failure recorded against an entity or feed session
///
/// Errors accumulate in arrival order and are never discarded; the most
/// recent one is exposed as the current error for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedError {
    pub message: String,
    pub timestamp: u64,
}

impl RecordedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: crate::models::now_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Validation("unknown sort type 'bestest'".to_string());
        assert_eq!(
            err.to_string(),
            "Validation error: unknown sort type 'bestest'"
        );

        let err = StoreError::PendingOperation("previous loadMore not resolved".to_string());
        assert!(err.to_string().contains("previous loadMore"));
    }
}
