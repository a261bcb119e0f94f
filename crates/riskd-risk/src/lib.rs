//! Risk enforcement for riskd.
//!
//! - `RiskState`: per-account ledger, one lock over all compound fields
//! - `RiskEngine`: breach detection, pause deadlines, trade permission
//! - `Clock`: injectable time source for deadline tests
//!
//! Breach handling is fail-closed: once a pause is written it is never
//! undone by a later logging, metrics or persistence failure.

pub mod clock;
pub mod engine;
pub mod error;
pub mod ledger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{PnlUpdate, RiskEngine};
pub use error::{RiskError, RiskResult};
pub use ledger::{MutationStrategy, RiskState};
