//! Risk error types.

use riskd_core::{AccountId, CoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Unknown account: {0} (not recovered or registered)")]
    UnknownAccount(AccountId),

    #[error("Account already registered: {0}")]
    AlreadyRegistered(AccountId),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] CoreError),
}

pub type RiskResult<T> = Result<T, RiskError>;
