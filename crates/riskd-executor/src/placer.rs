//! Order placement collaborators.
//!
//! Trait-based so the guard can be driven by a venue adapter in production
//! and by the mocks below in tests.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use riskd_core::{ClientOrderId, OpenRequest, StopLossSpec};

use crate::error::{ExecutorError, ExecutorResult};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Venue acknowledgement of a stop-loss order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopLossAck {
    pub cloid: ClientOrderId,
    pub exchange_order_id: Option<String>,
    /// Venue confirmed the stop is resting.
    pub confirmed: bool,
    pub acked_at: DateTime<Utc>,
}

impl StopLossAck {
    #[must_use]
    pub fn confirmed(cloid: ClientOrderId, exchange_order_id: impl Into<String>) -> Self {
        Self {
            cloid,
            exchange_order_id: Some(exchange_order_id.into()),
            confirmed: true,
            acked_at: Utc::now(),
        }
    }
}

/// Venue acknowledgement of an opened position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAck {
    pub cloid: ClientOrderId,
    pub opened_at: DateTime<Utc>,
}

/// Places protective stop orders.
pub trait StopLossPlacer: Send + Sync {
    fn place_stop_loss<'a>(&'a self, spec: &'a StopLossSpec)
        -> BoxFuture<'a, ExecutorResult<StopLossAck>>;
}

/// Opens positions. Only ever called by the guard after a confirmed stop.
pub trait PositionOpener: Send + Sync {
    fn open_position<'a>(
        &'a self,
        request: &'a OpenRequest,
        stop_loss: Option<&'a StopLossAck>,
    ) -> BoxFuture<'a, ExecutorResult<OpenAck>>;
}

/// Arc wrapper for StopLossPlacer trait objects.
pub type DynStopLossPlacer = Arc<dyn StopLossPlacer>;

// ============================================================================
// Mocks
// ============================================================================

/// Scripted behaviour for `MockStopLossPlacer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockPlacement {
    /// Ack with `confirmed = true`.
    Confirm,
    /// Ack with `confirmed = false`.
    Unconfirmed,
    /// Return `PlacementFailed(reason)`.
    Fail(String),
    /// Never answer within `delay`.
    Delay(Duration),
}

/// Mock stop-loss placer for testing.
#[derive(Debug)]
pub struct MockStopLossPlacer {
    placements: Mutex<Vec<StopLossSpec>>,
    next_result: Mutex<MockPlacement>,
}

impl Default for MockStopLossPlacer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStopLossPlacer {
    /// Create a mock that confirms every placement.
    pub fn new() -> Self {
        Self {
            placements: Mutex::new(Vec::new()),
            next_result: Mutex::new(MockPlacement::Confirm),
        }
    }

    /// Set the behaviour for subsequent placements.
    pub fn set_next_result(&self, result: MockPlacement) {
        *self.next_result.lock() = result;
    }

    /// Stop specs received so far.
    pub fn placements(&self) -> Vec<StopLossSpec> {
        self.placements.lock().clone()
    }
}

impl StopLossPlacer for MockStopLossPlacer {
    fn place_stop_loss<'a>(
        &'a self,
        spec: &'a StopLossSpec,
    ) -> BoxFuture<'a, ExecutorResult<StopLossAck>> {
        Box::pin(async move {
            self.placements.lock().push(spec.clone());
            let behaviour = self.next_result.lock().clone();
            match behaviour {
                MockPlacement::Confirm => Ok(StopLossAck::confirmed(
                    spec.cloid.clone(),
                    format!("mock-{}", spec.cloid),
                )),
                MockPlacement::Unconfirmed => Ok(StopLossAck {
                    cloid: spec.cloid.clone(),
                    exchange_order_id: None,
                    confirmed: false,
                    acked_at: Utc::now(),
                }),
                MockPlacement::Fail(reason) => Err(ExecutorError::PlacementFailed(reason)),
                MockPlacement::Delay(d) => {
                    tokio::time::sleep(d).await;
                    Ok(StopLossAck::confirmed(spec.cloid.clone(), "late"))
                }
            }
        })
    }
}

/// One recorded `open_position` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenCall {
    pub request: OpenRequest,
    pub stop_loss: Option<StopLossAck>,
}

/// Mock position opener for testing.
#[derive(Debug, Default)]
pub struct MockPositionOpener {
    opens: Mutex<Vec<OpenCall>>,
    fail_with: Mutex<Option<String>>,
}

impl MockPositionOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail subsequent opens with `OpenFailed(reason)`, or succeed on `None`.
    pub fn set_failure(&self, reason: Option<String>) {
        *self.fail_with.lock() = reason;
    }

    /// Opens received so far.
    pub fn opens(&self) -> Vec<OpenCall> {
        self.opens.lock().clone()
    }
}

impl PositionOpener for MockPositionOpener {
    fn open_position<'a>(
        &'a self,
        request: &'a OpenRequest,
        stop_loss: Option<&'a StopLossAck>,
    ) -> BoxFuture<'a, ExecutorResult<OpenAck>> {
        Box::pin(async move {
            if let Some(reason) = self.fail_with.lock().clone() {
                return Err(ExecutorError::OpenFailed(reason));
            }
            self.opens.lock().push(OpenCall {
                request: request.clone(),
                stop_loss: stop_loss.cloned(),
            });
            Ok(OpenAck {
                cloid: request.cloid.clone(),
                opened_at: Utc::now(),
            })
        })
    }
}
