//! Per-account risk ledger.
//!
//! `RiskState` owns one account's compound risk fields (daily P&L, peak
//! equity, drawdown, pause deadline, sequence number) behind a single mutex.
//! Every mutation advances the sequence number and keeps
//! `current_drawdown = max(0, peak_equity - current_equity)`.
//!
//! Two mutation strategies exist for `update_daily_pnl`:
//! - `Synchronized`: read-modify-write inside one critical section. The only
//!   strategy available in normal builds.
//! - `Unsynchronized`: read and write in two separate critical sections, so
//!   concurrent updates can be lost. Compiled only under `cfg(test)` or the
//!   `racy-ledger` feature, as a negative control for the locking discipline.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use riskd_core::{AccountId, FeatureFlagSnapshot, Money, PauseDeadline, RiskSnapshot};

// ============================================================================
// MutationStrategy
// ============================================================================

/// How `update_daily_pnl` touches the shared fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStrategy {
    /// Whole read-modify-write under the account lock.
    Synchronized,
    /// Split read and write; loses updates under contention.
    #[cfg(any(test, feature = "racy-ledger"))]
    Unsynchronized,
}

impl MutationStrategy {
    /// Pick the strategy for a ledger built under `flags`.
    ///
    /// Without the racy strategy compiled in, a disabled mutex-protection
    /// flag is ignored and the synchronized path is used.
    pub fn from_flags(flags: &FeatureFlagSnapshot) -> Self {
        if flags.enable_mutex_protection {
            return Self::Synchronized;
        }
        #[cfg(any(test, feature = "racy-ledger"))]
        let strategy = {
            warn!("Mutex protection disabled: using unsynchronized ledger strategy");
            Self::Unsynchronized
        };
        #[cfg(not(any(test, feature = "racy-ledger")))]
        let strategy = {
            warn!("Mutex protection flag is off but this build only has the synchronized ledger");
            Self::Synchronized
        };
        strategy
    }
}

// ============================================================================
// Field updates (always called with the lock held)
// ============================================================================

pub(crate) fn touch(s: &mut RiskSnapshot, now: DateTime<Utc>) {
    s.sequence += 1;
    s.last_updated = now;
}

pub(crate) fn apply_delta(s: &mut RiskSnapshot, delta: Money, now: DateTime<Utc>) {
    s.daily_pnl += delta;
    let equity = s.current_equity();
    if equity > s.peak_equity {
        s.peak_equity = equity;
    }
    s.current_drawdown = (s.peak_equity - equity).floor_zero();
    touch(s, now);
}

/// Extend the pause to `deadline` unless it already runs at least as long.
pub(crate) fn extend_pause(s: &mut RiskSnapshot, deadline: PauseDeadline, now: DateTime<Utc>) -> bool {
    let longer = s.paused_until.map(|cur| deadline > cur).unwrap_or(true);
    if longer {
        s.paused_until = Some(deadline);
        touch(s, now);
    }
    longer
}

/// Fold `stored` into a ledger that was started without it.
///
/// `stored` becomes the base and the P&L accrued since startup is re-applied
/// on top. The longer pause wins and the sequence continues above both.
pub(crate) fn merge_recovered(s: &mut RiskSnapshot, stored: &RiskSnapshot, now: DateTime<Utc>) {
    let accrued = s.daily_pnl;
    let pause = s.paused_until;
    let sequence = s.sequence.max(stored.sequence);

    *s = RiskSnapshot {
        sequence,
        ..stored.clone()
    };
    if pause.is_some_and(|p| s.paused_until.map_or(true, |cur| p > cur)) {
        s.paused_until = pause;
    }
    apply_delta(s, accrued, now);
}

// ============================================================================
// RiskState
// ============================================================================

/// Concurrency-safe risk ledger for one account.
///
/// Thread-safe: share via `Arc<RiskState>`. Readers get copies only.
#[derive(Debug)]
pub struct RiskState {
    strategy: MutationStrategy,
    inner: Mutex<RiskSnapshot>,
}

impl RiskState {
    /// Fresh ledger: flat P&L, peak equity at `start_equity`, not paused.
    #[must_use]
    pub fn new(account: AccountId, start_equity: Money) -> Self {
        Self::restore(RiskSnapshot::fresh(account, start_equity, Utc::now()))
    }

    /// Ledger continuing from a recovered snapshot.
    #[must_use]
    pub fn restore(snapshot: RiskSnapshot) -> Self {
        Self {
            strategy: MutationStrategy::Synchronized,
            inner: Mutex::new(snapshot),
        }
    }

    /// Conservative ledger for an account whose durable state could not be
    /// read: paused until an operator resumes it.
    #[must_use]
    pub fn conservative(account: AccountId, start_equity: Money) -> Self {
        let mut snapshot = RiskSnapshot::fresh(account, start_equity, Utc::now());
        snapshot.paused_until = Some(PauseDeadline::Indefinite);
        Self::restore(snapshot)
    }

    /// Select the mutation strategy. Fixed for the ledger's lifetime.
    #[must_use]
    pub fn with_strategy(mut self, strategy: MutationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn strategy(&self) -> MutationStrategy {
        self.strategy
    }

    #[must_use]
    pub fn account(&self) -> AccountId {
        self.inner.lock().account.clone()
    }

    /// Immutable copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> RiskSnapshot {
        self.inner.lock().clone()
    }

    /// Add `delta` to daily P&L, recompute drawdown, advance the sequence.
    pub fn update_daily_pnl(&self, delta: Money) -> RiskSnapshot {
        self.update_then(delta, Utc::now(), |_| ()).0
    }

    /// Apply `delta`, then run `then` on the updated fields.
    ///
    /// Under the synchronized strategy both steps share one critical
    /// section, so `then` sees exactly the state this update produced.
    pub(crate) fn update_then<R>(
        &self,
        delta: Money,
        now: DateTime<Utc>,
        then: impl FnOnce(&mut RiskSnapshot) -> R,
    ) -> (RiskSnapshot, R) {
        match self.strategy {
            MutationStrategy::Synchronized => {
                let mut guard = self.inner.lock();
                apply_delta(&mut guard, delta, now);
                let out = then(&mut guard);
                (guard.clone(), out)
            }
            #[cfg(any(test, feature = "racy-ledger"))]
            MutationStrategy::Unsynchronized => {
                let mut copy = self.inner.lock().clone();
                apply_delta(&mut copy, delta, now);
                std::thread::yield_now();
                *self.inner.lock() = copy;
                self.locked(then)
            }
        }
    }

    /// Run `f` with the lock held; returns the resulting snapshot too.
    pub(crate) fn locked<R>(&self, f: impl FnOnce(&mut RiskSnapshot) -> R) -> (RiskSnapshot, R) {
        let mut guard = self.inner.lock();
        let out = f(&mut guard);
        (guard.clone(), out)
    }

    /// Set the pause deadline. Never shortens a longer pause.
    ///
    /// Returns true if the deadline changed.
    pub fn set_paused_until(&self, deadline: PauseDeadline) -> bool {
        self.locked(|s| extend_pause(s, deadline, Utc::now())).1
    }

    /// Operator resume: clear the pause and its breach kinds.
    pub fn clear_pause(&self) -> RiskSnapshot {
        self.clear_pause_at(Utc::now())
    }

    pub(crate) fn clear_pause_at(&self, now: DateTime<Utc>) -> RiskSnapshot {
        self.locked(|s| {
            s.paused_until = None;
            s.active_breaches.clear();
            touch(s, now);
        })
        .0
    }

    /// Start a new trading day at `start_equity`. An active pause stays.
    pub fn roll_day(&self, start_equity: Money) -> RiskSnapshot {
        self.roll_day_at(start_equity, Utc::now())
    }

    pub(crate) fn roll_day_at(&self, start_equity: Money, now: DateTime<Utc>) -> RiskSnapshot {
        self.locked(|s| {
            s.daily_pnl = Money::ZERO;
            s.session_start_equity = start_equity;
            s.peak_equity = start_equity;
            s.current_drawdown = Money::ZERO;
            touch(s, now);
        })
        .0
    }
}
