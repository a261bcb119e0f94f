//! Stop-loss guarded position opening.
//!
//! # Decision order (in `TradeGuard::evaluate`)
//!
//! 1. Guarded stop-loss disabled -> Permitted (no stop placed)
//! 2. Risk engine forbids trading -> Blocked::RiskPaused
//! 3. No usable stop-loss on the request -> Blocked::MissingStopLoss
//! 4. Placement error, timeout or unconfirmed ack -> Blocked::PlacementFailure
//! 5. Confirmed ack -> Permitted
//!
//! Exposure is never taken before protection: `open` calls the opener only
//! with a `Permitted` decision in hand.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use riskd_core::{FeatureFlagSnapshot, OpenRequest, StopLossSpec};
use riskd_risk::{Clock, RiskEngine, SystemClock};
use riskd_telemetry::Metrics;

use crate::error::ExecutorResult;
use crate::placer::{DynStopLossPlacer, OpenAck, PositionOpener, StopLossAck};

/// Why an open was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockReason {
    /// Risk engine has trading paused for the account.
    RiskPaused,
    /// No protective stop was attached, or it does not cover the entry.
    MissingStopLoss,
    /// Stop placement errored, timed out or was not confirmed.
    PlacementFailure,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RiskPaused => "RiskPaused",
            Self::MissingStopLoss => "MissingStopLoss",
            Self::PlacementFailure => "PlacementFailure",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guard verdict for one open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Open may proceed. `ack` is `None` only when the guard is disabled.
    Permitted { ack: Option<StopLossAck> },
    Blocked { reason: BlockReason },
}

impl GuardDecision {
    #[must_use]
    pub fn is_permitted(&self) -> bool {
        matches!(self, Self::Permitted { .. })
    }

    #[must_use]
    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            Self::Blocked { reason } => Some(*reason),
            Self::Permitted { .. } => None,
        }
    }
}

/// Result of `TradeGuard::open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened {
        position: OpenAck,
        stop_loss: Option<StopLossAck>,
    },
    Blocked {
        reason: BlockReason,
    },
}

/// Stop covers the entry: same account and symbol, opposite side, full size.
fn covers(request: &OpenRequest, stop: &StopLossSpec) -> bool {
    stop.account == request.account
        && stop.symbol == request.symbol
        && stop.side == request.side.opposite()
        && stop.size == request.size
}

/// Gates position opening on risk permission and a confirmed stop-loss.
pub struct TradeGuard<C: Clock = SystemClock> {
    engine: Arc<RiskEngine<C>>,
    placer: DynStopLossPlacer,
    placement_timeout: Duration,
}

impl<C: Clock> TradeGuard<C> {
    pub fn new(engine: Arc<RiskEngine<C>>, placer: DynStopLossPlacer, placement_timeout: Duration) -> Self {
        Self {
            engine,
            placer,
            placement_timeout,
        }
    }

    #[must_use]
    pub fn placement_timeout(&self) -> Duration {
        self.placement_timeout
    }

    fn blocked(request: &OpenRequest, reason: BlockReason, detail: &str) -> GuardDecision {
        Metrics::guard_blocked(reason.as_str());
        warn!(
            account = %request.account,
            cloid = %request.cloid,
            symbol = %request.symbol,
            %reason,
            detail,
            "Open blocked"
        );
        GuardDecision::Blocked { reason }
    }

    /// Decide whether `request` may open. Places the stop-loss if required.
    ///
    /// Never returns an error: every failure is a `Blocked` decision.
    pub async fn evaluate(&self, request: &OpenRequest, flags: &FeatureFlagSnapshot) -> GuardDecision {
        if !flags.enable_guarded_stop_loss {
            debug!(cloid = %request.cloid, "Guarded stop-loss disabled, open permitted");
            Metrics::guard_permitted();
            return GuardDecision::Permitted { ack: None };
        }

        if !self.engine.can_trade(&request.account, flags) {
            return Self::blocked(request, BlockReason::RiskPaused, "trading paused");
        }

        let Some(spec) = request.stop_loss.as_ref() else {
            return Self::blocked(request, BlockReason::MissingStopLoss, "no stop attached");
        };
        if !covers(request, spec) {
            return Self::blocked(
                request,
                BlockReason::MissingStopLoss,
                "stop does not cover the entry",
            );
        }

        let placed =
            tokio::time::timeout(self.placement_timeout, self.placer.place_stop_loss(spec)).await;
        match placed {
            Ok(Ok(ack)) if ack.confirmed && ack.cloid == spec.cloid => {
                info!(
                    account = %request.account,
                    cloid = %request.cloid,
                    stop_cloid = %spec.cloid,
                    trigger = %spec.trigger_price,
                    "Stop-loss confirmed, open permitted"
                );
                Metrics::guard_permitted();
                GuardDecision::Permitted { ack: Some(ack) }
            }
            Ok(Ok(ack)) if !ack.confirmed => {
                Self::blocked(request, BlockReason::PlacementFailure, "stop not confirmed")
            }
            Ok(Ok(_)) => Self::blocked(
                request,
                BlockReason::PlacementFailure,
                "ack for a different order",
            ),
            Ok(Err(e)) => Self::blocked(request, BlockReason::PlacementFailure, &e.to_string()),
            Err(_) => Self::blocked(request, BlockReason::PlacementFailure, "placement timed out"),
        }
    }

    /// Run the full protocol: evaluate, then open only if permitted.
    ///
    /// An `Err` comes from the opener itself, after protection was in place.
    pub async fn open(
        &self,
        request: &OpenRequest,
        opener: &dyn PositionOpener,
        flags: &FeatureFlagSnapshot,
    ) -> ExecutorResult<OpenOutcome> {
        let stop_loss = match self.evaluate(request, flags).await {
            GuardDecision::Permitted { ack } => ack,
            GuardDecision::Blocked { reason } => return Ok(OpenOutcome::Blocked { reason }),
        };

        let position = opener.open_position(request, stop_loss.as_ref()).await?;
        info!(
            account = %request.account,
            cloid = %request.cloid,
            protected = stop_loss.is_some(),
            "Position opened"
        );
        Ok(OpenOutcome::Opened {
            position,
            stop_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placer::{MockPlacement, MockPositionOpener, MockStopLossPlacer};
    use riskd_core::{AccountId, Money, OrderSide, Price, RiskThresholds, Size};
    use riskd_risk::RiskState;
    use rust_decimal_macros::dec;

    fn account() -> AccountId {
        AccountId::new("guarded")
    }

    fn setup() -> (TradeGuard, Arc<RiskEngine>, Arc<MockStopLossPlacer>) {
        let thresholds = RiskThresholds::new(
            Money::new(dec!(1000)),
            Money::new(dec!(5000)),
            Duration::from_secs(60),
        )
        .unwrap();
        let engine = Arc::new(RiskEngine::new(thresholds));
        engine
            .register(RiskState::new(account(), Money::new(dec!(10000))))
            .unwrap();
        let placer = Arc::new(MockStopLossPlacer::new());
        let guard = TradeGuard::new(engine.clone(), placer.clone(), Duration::from_millis(50));
        (guard, engine, placer)
    }

    fn request() -> OpenRequest {
        OpenRequest::new(account(), "BTC", OrderSide::Buy, Size::new(dec!(0.5)))
            .with_stop_at(Price::new(dec!(60000)))
    }

    fn flags() -> FeatureFlagSnapshot {
        FeatureFlagSnapshot::default()
    }

    #[tokio::test]
    async fn test_confirmed_stop_permits() {
        let (guard, _, placer) = setup();
        let decision = guard.evaluate(&request(), &flags()).await;
        assert!(decision.is_permitted());
        assert_eq!(placer.placements().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_guard_skips_everything() {
        let (guard, engine, placer) = setup();
        engine
            .apply_pnl(&account(), Money::new(dec!(-2000)), &flags())
            .unwrap();
        let mut req = request();
        req.stop_loss = None;

        let decision = guard
            .evaluate(&req, &flags().with_guarded_stop_loss(false))
            .await;
        assert_eq!(decision, GuardDecision::Permitted { ack: None });
        assert!(placer.placements().is_empty());
    }

    #[tokio::test]
    async fn test_paused_account_blocks_before_placement() {
        let (guard, engine, placer) = setup();
        engine
            .apply_pnl(&account(), Money::new(dec!(-1050)), &flags())
            .unwrap();

        let decision = guard.evaluate(&request(), &flags()).await;
        assert_eq!(decision.block_reason(), Some(BlockReason::RiskPaused));
        assert!(placer.placements().is_empty());
    }

    #[tokio::test]
    async fn test_missing_stop_blocks() {
        let (guard, _, _) = setup();
        let mut req = request();
        req.stop_loss = None;
        let decision = guard.evaluate(&req, &flags()).await;
        assert_eq!(decision.block_reason(), Some(BlockReason::MissingStopLoss));
    }

    #[tokio::test]
    async fn test_stop_on_wrong_side_blocks() {
        let (guard, _, placer) = setup();
        let mut req = request();
        if let Some(stop) = req.stop_loss.as_mut() {
            stop.side = OrderSide::Buy;
        }
        let decision = guard.evaluate(&req, &flags()).await;
        assert_eq!(decision.block_reason(), Some(BlockReason::MissingStopLoss));
        assert!(placer.placements().is_empty());
    }

    #[tokio::test]
    async fn test_placement_failures_block() {
        let (guard, _, placer) = setup();
        for behaviour in [
            MockPlacement::Fail("venue rejected".to_string()),
            MockPlacement::Unconfirmed,
            MockPlacement::Delay(Duration::from_secs(5)),
        ] {
            placer.set_next_result(behaviour.clone());
            let decision = guard.evaluate(&request(), &flags()).await;
            assert_eq!(
                decision.block_reason(),
                Some(BlockReason::PlacementFailure),
                "{behaviour:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_open_only_after_confirmation() {
        let (guard, _, placer) = setup();
        let opener = MockPositionOpener::new();

        placer.set_next_result(MockPlacement::Fail("down".to_string()));
        let outcome = guard.open(&request(), &opener, &flags()).await.unwrap();
        assert_eq!(
            outcome,
            OpenOutcome::Blocked {
                reason: BlockReason::PlacementFailure
            }
        );
        assert!(opener.opens().is_empty());

        placer.set_next_result(MockPlacement::Confirm);
        let req = request();
        let outcome = guard.open(&req, &opener, &flags()).await.unwrap();
        assert!(matches!(outcome, OpenOutcome::Opened { .. }));

        let opens = opener.opens();
        assert_eq!(opens.len(), 1);
        let ack = opens[0].stop_loss.as_ref().unwrap();
        assert!(ack.confirmed);
        assert_eq!(Some(&ack.cloid), req.stop_loss.as_ref().map(|s| &s.cloid));
    }

    #[tokio::test]
    async fn test_opener_error_surfaces() {
        let (guard, _, _) = setup();
        let opener = MockPositionOpener::new();
        opener.set_failure(Some("margin".to_string()));
        let err = guard.open(&request(), &opener, &flags()).await.unwrap_err();
        assert!(matches!(err, crate::error::ExecutorError::OpenFailed(_)));
    }
}
