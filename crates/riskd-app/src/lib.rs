//! riskd daemon.
//!
//! Loads configuration, recovers each account's risk state from the durable
//! store, and drains pending snapshots on shutdown.

pub mod app;
pub mod config;
pub mod error;

pub use app::{Application, RecoverySummary};
pub use config::{AppConfig, GuardConfig, PersistenceBackend, PersistenceConfig, RiskConfig};
pub use error::{AppError, AppResult};
