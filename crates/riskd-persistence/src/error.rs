//! Persistence error types.

use thiserror::Error;

/// Error returned by a `SnapshotStore`.
///
/// The queue worker retries `Transient` and gives up at once on `Permanent`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Permanent storage error: {0}")]
    Permanent(String),
}

impl StoreError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::PermissionDenied => {
                Self::Permanent(e.to_string())
            }
            _ => Self::Transient(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        // A snapshot that cannot be encoded or decoded will not get better.
        Self::Permanent(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Invalid persistence config: {0}")]
    InvalidConfig(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
