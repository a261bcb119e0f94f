//! Risk state, limits, and breach types.
//!
//! `RiskSnapshot` is the immutable, serialisable copy of an account's live
//! risk ledger. It is what the engine hands out to readers, what breach
//! events carry, and what the persistence layer mirrors to durable storage.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::decimal::Money;
use crate::error::{CoreError, Result};

// ============================================================================
// PauseDeadline
// ============================================================================

/// How long trading stays paused.
///
/// Ordered so that any `Until` is shorter than `Indefinite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "at", rename_all = "snake_case")]
pub enum PauseDeadline {
    /// Paused until the given instant.
    Until(DateTime<Utc>),
    /// Paused until an operator resumes the account.
    Indefinite,
}

impl PauseDeadline {
    /// Deadline for a breach detected at `now` under `cooldown`.
    ///
    /// A zero cooldown means "wait for the operator".
    pub fn after(now: DateTime<Utc>, cooldown: Duration) -> Self {
        if cooldown.is_zero() {
            return Self::Indefinite;
        }
        match chrono::Duration::from_std(cooldown) {
            Ok(d) => now
                .checked_add_signed(d)
                .map(Self::Until)
                .unwrap_or(Self::Indefinite),
            Err(_) => Self::Indefinite,
        }
    }

    /// True while `now` is strictly before the deadline.
    #[inline]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Until(t) => now < *t,
            Self::Indefinite => true,
        }
    }
}

impl fmt::Display for PauseDeadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Until(t) => write!(f, "{}", t.to_rfc3339()),
            Self::Indefinite => write!(f, "indefinite"),
        }
    }
}

// ============================================================================
// BreachKind / BreachEvent
// ============================================================================

/// Which limit was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BreachKind {
    /// `daily_pnl <= -max_daily_loss`.
    DailyLossBreach,
    /// `current_drawdown >= max_drawdown`.
    DrawdownBreach,
}

impl BreachKind {
    pub const ALL: [Self; 2] = [Self::DailyLossBreach, Self::DrawdownBreach];

    /// Stable label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyLossBreach => "daily_loss",
            Self::DrawdownBreach => "drawdown",
        }
    }
}

impl fmt::Display for BreachKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DailyLossBreach => write!(f, "DailyLossBreach"),
            Self::DrawdownBreach => write!(f, "DrawdownBreach"),
        }
    }
}

/// A breach transition: created once when an account becomes paused for a kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreachEvent {
    pub account: AccountId,
    pub kind: BreachKind,
    pub detected_at: DateTime<Utc>,
    /// Metric value that crossed the limit (daily P&L or drawdown).
    pub metric: Money,
    /// Configured limit it was compared against.
    pub threshold: Money,
    /// State right after the pause was applied.
    pub snapshot: RiskSnapshot,
}

// ============================================================================
// RiskSnapshot
// ============================================================================

/// Immutable point-in-time copy of an account's risk state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub account: AccountId,
    /// Realized + unrealized P&L since the start of the trading day.
    pub daily_pnl: Money,
    /// Equity at the start of the trading day.
    pub session_start_equity: Money,
    /// Running maximum of current equity within the day.
    pub peak_equity: Money,
    /// `max(0, peak_equity - current_equity)`.
    pub current_drawdown: Money,
    pub paused_until: Option<PauseDeadline>,
    /// Breach kinds the current pause was raised for.
    #[serde(default)]
    pub active_breaches: BTreeSet<BreachKind>,
    /// Strictly increasing per mutation.
    pub sequence: u64,
    pub last_updated: DateTime<Utc>,
}

impl RiskSnapshot {
    /// Fresh state for a new account: flat P&L, not paused, sequence 0.
    pub fn fresh(account: AccountId, start_equity: Money, now: DateTime<Utc>) -> Self {
        Self {
            account,
            daily_pnl: Money::ZERO,
            session_start_equity: start_equity,
            peak_equity: start_equity,
            current_drawdown: Money::ZERO,
            paused_until: None,
            active_breaches: BTreeSet::new(),
            sequence: 0,
            last_updated: now,
        }
    }

    #[inline]
    pub fn current_equity(&self) -> Money {
        self.session_start_equity + self.daily_pnl
    }

    /// True while a pause deadline is still in the future.
    #[inline]
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        self.paused_until
            .map(|d| d.is_active_at(now))
            .unwrap_or(false)
    }

    /// Check the drawdown invariant against the other fields.
    pub fn drawdown_consistent(&self) -> bool {
        self.current_drawdown == (self.peak_equity - self.current_equity()).floor_zero()
    }
}

// ============================================================================
// RiskThresholds
// ============================================================================

/// Limits for one trading session. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholds {
    max_daily_loss: Money,
    max_drawdown: Money,
    pause_cooldown: Duration,
}

impl RiskThresholds {
    /// Validate and build thresholds.
    ///
    /// Both loss limits must be strictly positive amounts. A zero cooldown
    /// pauses indefinitely on breach.
    pub fn new(max_daily_loss: Money, max_drawdown: Money, pause_cooldown: Duration) -> Result<Self> {
        if !max_daily_loss.is_positive() {
            return Err(CoreError::InvalidConfig(format!(
                "max_daily_loss must be > 0, got {max_daily_loss}"
            )));
        }
        if !max_drawdown.is_positive() {
            return Err(CoreError::InvalidConfig(format!(
                "max_drawdown must be > 0, got {max_drawdown}"
            )));
        }
        Ok(Self {
            max_daily_loss,
            max_drawdown,
            pause_cooldown,
        })
    }

    #[inline]
    pub fn max_daily_loss(&self) -> Money {
        self.max_daily_loss
    }

    #[inline]
    pub fn max_drawdown(&self) -> Money {
        self.max_drawdown
    }

    #[inline]
    pub fn pause_cooldown(&self) -> Duration {
        self.pause_cooldown
    }

    /// Kinds breached by `snapshot`, with the metric and limit for each.
    ///
    /// Pure: no clock, no side effects.
    pub fn breaches(&self, snapshot: &RiskSnapshot) -> Vec<(BreachKind, Money, Money)> {
        let mut out = Vec::with_capacity(2);
        if snapshot.daily_pnl <= -self.max_daily_loss {
            out.push((
                BreachKind::DailyLossBreach,
                snapshot.daily_pnl,
                self.max_daily_loss,
            ));
        }
        if snapshot.current_drawdown >= self.max_drawdown {
            out.push((
                BreachKind::DrawdownBreach,
                snapshot.current_drawdown,
                self.max_drawdown,
            ));
        }
        out
    }
}
