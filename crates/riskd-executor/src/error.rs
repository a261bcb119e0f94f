//! Executor error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("Stop-loss placement failed: {0}")]
    PlacementFailed(String),

    #[error("Position open failed: {0}")]
    OpenFailed(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
