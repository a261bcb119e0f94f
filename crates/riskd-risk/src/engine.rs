//! Risk engine: breach detection, pause enforcement, trade permission.
//!
//! Per account the engine cycles `Normal -> Paused -> Normal`. A mutation and
//! its assessment run in the same per-account critical section, so two
//! concurrent losers can never both raise the same breach. Side effects
//! (breach log, metrics, snapshot hand-off) run after the lock is released
//! and can never undo a pause that was already applied.
//!
//! Feature flags arrive as a `FeatureFlagSnapshot` argument on every call;
//! the engine never reads a flag source itself.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use riskd_core::{
    AccountId, BreachEvent, BreachKind, FeatureFlagSnapshot, Money, PauseDeadline,
    PersistenceRecord, RiskSnapshot, RiskThresholds, SnapshotCause, SnapshotSink,
};
use riskd_telemetry::Metrics;

use crate::clock::{Clock, SystemClock};
use crate::error::{RiskError, RiskResult};
use crate::ledger::{extend_pause, merge_recovered, touch, MutationStrategy, RiskState};

/// Outcome of a P&L update.
#[derive(Debug, Clone)]
pub struct PnlUpdate {
    /// State after the update and any pause it caused.
    pub snapshot: RiskSnapshot,
    /// Breach transitions raised by this update (0, 1 or 2).
    pub breaches: Vec<BreachEvent>,
}

impl PnlUpdate {
    #[must_use]
    pub fn breached(&self) -> bool {
        !self.breaches.is_empty()
    }
}

/// What one assessment changed.
#[derive(Debug, Default)]
struct Assessment {
    /// Breach kinds newly raised, with metric and limit.
    raised: Vec<(BreachKind, Money, Money)>,
    /// A lapsed pause was cleared.
    lapsed: bool,
}

/// Compare `s` against `thresholds` and pause on new breaches.
///
/// Must be called with the account lock held. Pure apart from the mutation
/// of `s`: no logging, no I/O.
fn assess_locked(s: &mut RiskSnapshot, thresholds: &RiskThresholds, now: DateTime<Utc>) -> Assessment {
    // Lapsed pause: back to Normal, kinds may fire again.
    let lapsed = !s.active_breaches.is_empty() && !s.is_paused_at(now);
    if lapsed {
        s.active_breaches.clear();
        touch(s, now);
    }

    let paused = s.is_paused_at(now);
    let raised: Vec<_> = thresholds
        .breaches(s)
        .into_iter()
        .filter(|(kind, _, _)| !(paused && s.active_breaches.contains(kind)))
        .collect();

    if raised.is_empty() {
        return Assessment { raised, lapsed };
    }

    for (kind, _, _) in &raised {
        s.active_breaches.insert(*kind);
    }
    let deadline = PauseDeadline::after(now, thresholds.pause_cooldown());
    if !extend_pause(s, deadline, now) {
        // Deadline unchanged but the breach set grew.
        touch(s, now);
    }
    Assessment { raised, lapsed }
}

/// Evaluates risk state against thresholds and answers trade permission.
///
/// Thread-safe: share via `Arc<RiskEngine>`. Accounts are independent; there
/// is no lock spanning more than one account.
pub struct RiskEngine<C: Clock = SystemClock> {
    thresholds: RiskThresholds,
    accounts: DashMap<AccountId, Arc<RiskState>>,
    sink: Option<Arc<dyn SnapshotSink>>,
    clock: C,
}

impl RiskEngine<SystemClock> {
    /// Create an engine using the system clock.
    #[must_use]
    pub fn new(thresholds: RiskThresholds) -> Self {
        Self::with_clock(thresholds, SystemClock)
    }
}

impl<C: Clock> RiskEngine<C> {
    /// Create an engine with an explicit clock.
    #[must_use]
    pub fn with_clock(thresholds: RiskThresholds, clock: C) -> Self {
        Self {
            thresholds,
            accounts: DashMap::new(),
            sink: None,
            clock,
        }
    }

    /// Hand snapshots to `sink` when persistence is enabled.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    /// Install state for an account. Updates are rejected until this is done.
    pub fn register(&self, state: RiskState) -> RiskResult<()> {
        let account = state.account();
        let paused = state.snapshot().is_paused_at(self.clock.now());
        match self.accounts.entry(account.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RiskError::AlreadyRegistered(account))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(state));
                Metrics::trading_paused(account.as_str(), paused);
                info!(account = %account, paused, "Account registered");
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn is_registered(&self, account: &AccountId) -> bool {
        self.accounts.contains_key(account)
    }

    /// Mutation strategy the account's ledger was built with.
    pub fn strategy(&self, account: &AccountId) -> RiskResult<MutationStrategy> {
        Ok(self.state(account)?.strategy())
    }

    #[must_use]
    pub fn accounts(&self) -> Vec<AccountId> {
        self.accounts.iter().map(|e| e.key().clone()).collect()
    }

    fn state(&self, account: &AccountId) -> RiskResult<Arc<RiskState>> {
        self.accounts
            .get(account)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RiskError::UnknownAccount(account.clone()))
    }

    /// Current snapshot for `account`.
    pub fn snapshot(&self, account: &AccountId) -> RiskResult<RiskSnapshot> {
        Ok(self.state(account)?.snapshot())
    }

    /// Apply a P&L delta and assess it inline.
    pub fn apply_pnl(
        &self,
        account: &AccountId,
        delta: Money,
        flags: &FeatureFlagSnapshot,
    ) -> RiskResult<PnlUpdate> {
        let state = self.state(account)?;
        let now = self.clock.now();
        let enforce = flags.enable_risk_enforcement;
        let thresholds = &self.thresholds;

        let (snapshot, assessment) = state.update_then(delta, now, |s| {
            if enforce {
                assess_locked(s, thresholds, now)
            } else {
                Assessment::default()
            }
        });

        Ok(self.finish(snapshot, assessment, now, SnapshotCause::Mutation, flags))
    }

    /// Re-assess the current state without changing P&L.
    ///
    /// No-op when enforcement is disabled.
    pub fn assess(
        &self,
        account: &AccountId,
        flags: &FeatureFlagSnapshot,
    ) -> RiskResult<Vec<BreachEvent>> {
        let state = self.state(account)?;
        if !flags.enable_risk_enforcement {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let thresholds = &self.thresholds;
        let (snapshot, assessment) = state.locked(|s| assess_locked(s, thresholds, now));
        if assessment.raised.is_empty() && !assessment.lapsed {
            return Ok(Vec::new());
        }
        Ok(self
            .finish(snapshot, assessment, now, SnapshotCause::Mutation, flags)
            .breaches)
    }

    /// Fold a snapshot read from the store into an account that was
    /// registered without it, then assess and hand off the merged state.
    ///
    /// Used for accounts that started conservatively while the store was
    /// unreachable. The merged sequence is above `stored.sequence`, so the
    /// next snapshot can be committed over it.
    pub fn reconcile(
        &self,
        stored: &RiskSnapshot,
        flags: &FeatureFlagSnapshot,
    ) -> RiskResult<PnlUpdate> {
        let state = self.state(&stored.account)?;
        let now = self.clock.now();
        let enforce = flags.enable_risk_enforcement;
        let thresholds = &self.thresholds;

        let (snapshot, assessment) = state.locked(|s| {
            merge_recovered(s, stored, now);
            if enforce {
                assess_locked(s, thresholds, now)
            } else {
                Assessment::default()
            }
        });
        info!(
            account = %snapshot.account,
            stored_seq = stored.sequence,
            seq = snapshot.sequence,
            daily_pnl = %snapshot.daily_pnl,
            paused_until = ?snapshot.paused_until,
            "Risk state reconciled with store"
        );
        Ok(self.finish(snapshot, assessment, now, SnapshotCause::Recovery, flags))
    }

    /// Side effects of an update: breach events, logs, metrics, hand-off.
    fn finish(
        &self,
        snapshot: RiskSnapshot,
        assessment: Assessment,
        now: DateTime<Utc>,
        cause: SnapshotCause,
        flags: &FeatureFlagSnapshot,
    ) -> PnlUpdate {
        if assessment.lapsed {
            info!(account = %snapshot.account, seq = snapshot.sequence, "Trading pause lapsed");
        }
        let breaches: Vec<BreachEvent> = assessment
            .raised
            .into_iter()
            .map(|(kind, metric, threshold)| BreachEvent {
                account: snapshot.account.clone(),
                kind,
                detected_at: now,
                metric,
                threshold,
                snapshot: snapshot.clone(),
            })
            .collect();

        for b in &breaches {
            error!(
                account = %b.account,
                kind = %b.kind,
                metric = %b.metric,
                threshold = %b.threshold,
                daily_pnl = %snapshot.daily_pnl,
                drawdown = %snapshot.current_drawdown,
                paused_until = ?snapshot.paused_until,
                "RISK LIMIT BREACHED: {} (value {}, limit {})",
                b.kind,
                b.metric,
                b.threshold
            );
            Metrics::breach(b.kind.as_str());
        }
        Metrics::trading_paused(snapshot.account.as_str(), snapshot.is_paused_at(now));

        let kinds: Vec<BreachKind> = breaches.iter().map(|b| b.kind).collect();
        let cause = SnapshotCause::for_breaches(&kinds).unwrap_or(cause);
        self.hand_off(&snapshot, cause, flags);

        PnlUpdate { snapshot, breaches }
    }

    fn hand_off(&self, snapshot: &RiskSnapshot, cause: SnapshotCause, flags: &FeatureFlagSnapshot) {
        if !flags.enable_persistence {
            return;
        }
        let Some(sink) = &self.sink else {
            return;
        };
        let result = sink.enqueue(PersistenceRecord::pending(snapshot.clone(), cause));
        if !result.is_accepted() {
            warn!(
                account = %snapshot.account,
                seq = snapshot.sequence,
                ?result,
                ?cause,
                "Snapshot not accepted by persistence queue"
            );
        }
    }

    /// Trade permission for a snapshot at `now`.
    ///
    /// False only while enforcement is on and the pause deadline is in the
    /// future. Turning enforcement off bypasses the pause without clearing it.
    #[must_use]
    pub fn can_trade_snapshot(
        snapshot: &RiskSnapshot,
        flags: &FeatureFlagSnapshot,
        now: DateTime<Utc>,
    ) -> bool {
        !(flags.enable_risk_enforcement && snapshot.is_paused_at(now))
    }

    /// Trade permission for `account`.
    ///
    /// Unknown accounts fail closed while enforcement is on.
    #[must_use]
    pub fn can_trade(&self, account: &AccountId, flags: &FeatureFlagSnapshot) -> bool {
        if !flags.enable_risk_enforcement {
            return true;
        }
        match self.state(account) {
            Ok(state) => Self::can_trade_snapshot(&state.snapshot(), flags, self.clock.now()),
            Err(_) => {
                debug!(account = %account, "can_trade on unregistered account");
                false
            }
        }
    }

    /// Operator resume: clear the pause immediately.
    pub fn resume(&self, account: &AccountId, flags: &FeatureFlagSnapshot) -> RiskResult<RiskSnapshot> {
        let state = self.state(account)?;
        let previous = state.snapshot().paused_until;
        let snapshot = state.clear_pause_at(self.clock.now());

        warn!(
            account = %account,
            previous = ?previous,
            "Trading pause cleared by operator"
        );
        Metrics::trading_paused(account.as_str(), false);
        self.hand_off(&snapshot, SnapshotCause::OperatorResume, flags);
        Ok(snapshot)
    }

    /// Start a new trading day for `account` at `start_equity`.
    pub fn roll_day(
        &self,
        account: &AccountId,
        start_equity: Money,
        flags: &FeatureFlagSnapshot,
    ) -> RiskResult<RiskSnapshot> {
        let state = self.state(account)?;
        let snapshot = state.roll_day_at(start_equity, self.clock.now());
        info!(
            account = %account,
            start_equity = %start_equity,
            seq = snapshot.sequence,
            "Trading day rolled over"
        );
        self.hand_off(&snapshot, SnapshotCause::DayRollover, flags);
        Ok(snapshot)
    }
}
