//! Error types for jobline-state

use thiserror::Error;

/// Errors that can occur in the run ledger
#[derive(Error, Debug)]
pub enum StorageError {
    /// Run id is unknown to the ledger
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Operation requires a different run status
    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Digest string is not 64 hex characters
    #[error("Invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
