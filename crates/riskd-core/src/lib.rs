//! Core domain types for the riskd account risk engine.
//!
//! This crate provides the vocabulary shared by every other riskd crate:
//! - `AccountId`: Identifier of a trading account (the partition key)
//! - `Money`, `Price`, `Size`: Precision-safe numeric types
//! - `RiskSnapshot`, `RiskThresholds`, `BreachEvent`: Risk state and limits
//! - `PersistenceRecord`, `SnapshotSink`: Durable mirroring contract
//! - `FeatureFlagSnapshot`, `FeatureFlags`: Runtime safety toggles
//! - `OpenRequest`, `StopLossSpec`: Position-open requests for the trade guard

pub mod account;
pub mod decimal;
pub mod error;
pub mod flags;
pub mod order;
pub mod record;
pub mod types;

pub use account::AccountId;
pub use decimal::{Money, Price, Size};
pub use error::{CoreError, Result};
pub use flags::{FeatureFlagSnapshot, FeatureFlags, RuntimeFlags, StaticFlags};
pub use order::{ClientOrderId, OpenRequest, OrderSide, StopLossSpec};
pub use record::{EnqueueResult, PersistenceRecord, RecordStatus, SnapshotCause, SnapshotSink};
pub use types::{BreachEvent, BreachKind, PauseDeadline, RiskSnapshot, RiskThresholds};
