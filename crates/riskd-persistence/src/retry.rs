//! Commit retry policy: capped exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::error::{PersistenceError, PersistenceResult};

/// How often and how patiently a partition worker retries a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per record, including the first (>= 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_backoff: Duration,
    /// Ceiling for the exponential part of the delay.
    pub max_backoff: Duration,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_backoff: Duration,
        max_backoff: Duration,
        jitter: Duration,
    ) -> PersistenceResult<Self> {
        if max_attempts == 0 {
            return Err(PersistenceError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if base_backoff > max_backoff {
            return Err(PersistenceError::InvalidConfig(format!(
                "base_backoff ({base_backoff:?}) exceeds max_backoff ({max_backoff:?})"
            )));
        }
        Ok(Self {
            max_attempts,
            base_backoff,
            max_backoff,
            jitter,
        })
    }

    /// Policy with no waiting between attempts. Tests only need the counts.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based),
    /// without jitter.
    ///
    /// attempt=1 -> base, attempt=2 -> 2*base, attempt=3 -> 4*base, capped.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// `base_delay` plus uniform jitter in `[0, jitter]`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let extra = rand::rng().random_range(0..=jitter_ms);
        base + Duration::from_millis(extra)
    }

    /// True if another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn has_remaining(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
