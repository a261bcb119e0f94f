//! Position-open requests and their protective stop-loss.
//!
//! The trade guard only ever opens exposure described by an `OpenRequest`,
//! and only after the request's `StopLossSpec` has been placed and confirmed.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::account::AccountId;
use crate::decimal::{Price, Size};

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Client order ID for idempotency.
///
/// Every order (entry or stop) carries a unique cloid so that a retried
/// placement can be de-duplicated by the venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Create a new unique client order ID.
    ///
    /// Format: `riskd_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().to_string()[..8];
        Self(format!("riskd_{ts}_{uuid_short}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Protective stop for a prospective position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopLossSpec {
    pub cloid: ClientOrderId,
    pub account: AccountId,
    pub symbol: String,
    /// Side of the stop order (opposite of the entry).
    pub side: OrderSide,
    pub trigger_price: Price,
    pub size: Size,
}

/// Request to open a new position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub cloid: ClientOrderId,
    pub account: AccountId,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Size,
    /// Protective stop. `None` means no stop was attached.
    pub stop_loss: Option<StopLossSpec>,
}

impl OpenRequest {
    /// Entry request without a stop attached.
    pub fn new(account: AccountId, symbol: impl Into<String>, side: OrderSide, size: Size) -> Self {
        Self {
            cloid: ClientOrderId::new(),
            account,
            symbol: symbol.into(),
            side,
            size,
            stop_loss: None,
        }
    }

    /// Attach a stop at `trigger_price` covering the full entry size.
    #[must_use]
    pub fn with_stop_at(mut self, trigger_price: Price) -> Self {
        self.stop_loss = Some(StopLossSpec {
            cloid: ClientOrderId::new(),
            account: self.account.clone(),
            symbol: self.symbol.clone(),
            side: self.side.opposite(),
            trigger_price,
            size: self.size,
        });
        self
    }
}
