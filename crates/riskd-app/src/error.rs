//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Risk error: {0}")]
    Risk(#[from] riskd_risk::RiskError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] riskd_persistence::PersistenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] riskd_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<riskd_persistence::StoreError> for AppError {
    fn from(e: riskd_persistence::StoreError) -> Self {
        Self::Persistence(e.into())
    }
}

pub type AppResult<T> = Result<T, AppError>;
