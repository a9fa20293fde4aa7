//! Error types for the live store.

use thiserror::Error;

/// Main error type for store operations.
///
/// Most of the public surface is permissive and never fails; errors only
/// come out of stream I/O (backup/restore) and the sweep callback handed to
/// the expiration scheduler.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Store has been dropped")]
    StoreClosed,

    #[error("Sweep failed: {0}")]
    SweepFailed(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
