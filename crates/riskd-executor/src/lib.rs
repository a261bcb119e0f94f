//! Stop-loss guarded position opening for riskd.
//!
//! # Key Components
//!
//! - [`TradeGuard`]: risk check, then stop placement, then open
//! - [`StopLossPlacer`] / [`PositionOpener`]: venue-facing seams
//! - [`MockStopLossPlacer`] / [`MockPositionOpener`]: scripted test doubles
//!
//! # Guard Checks (in `TradeGuard::evaluate`)
//!
//! 1. Guard disabled -> Permitted
//! 2. Risk paused -> Blocked::RiskPaused
//! 3. Stop missing or not covering -> Blocked::MissingStopLoss
//! 4. Placement not confirmed in time -> Blocked::PlacementFailure
//! 5. (all passed) -> Permitted with the stop ack

pub mod error;
pub mod guard;
pub mod placer;

pub use error::{ExecutorError, ExecutorResult};
pub use guard::{BlockReason, GuardDecision, OpenOutcome, TradeGuard};
pub use placer::{
    BoxFuture, DynStopLossPlacer, MockPlacement, MockPositionOpener, MockStopLossPlacer, OpenAck,
    OpenCall, PositionOpener, StopLossAck, StopLossPlacer,
};
