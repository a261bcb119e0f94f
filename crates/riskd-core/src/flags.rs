//! Runtime feature flags.
//!
//! Four safety toggles are packed into one atomic word so that a reader
//! always gets a consistent `FeatureFlagSnapshot`: a flip of one flag can
//! never be observed half-applied alongside another. Components take the
//! snapshot once per decision and pass it down.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const MUTEX_PROTECTION: u8 = 1 << 0;
const RISK_ENFORCEMENT: u8 = 1 << 1;
const PERSISTENCE: u8 = 1 << 2;
const GUARDED_STOP_LOSS: u8 = 1 << 3;
const ALL: u8 = MUTEX_PROTECTION | RISK_ENFORCEMENT | PERSISTENCE | GUARDED_STOP_LOSS;

/// Immutable view of the flags at one decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlagSnapshot {
    #[serde(default = "enabled")]
    pub enable_mutex_protection: bool,
    #[serde(default = "enabled")]
    pub enable_risk_enforcement: bool,
    #[serde(default = "enabled")]
    pub enable_persistence: bool,
    #[serde(default = "enabled")]
    pub enable_guarded_stop_loss: bool,
}

fn enabled() -> bool {
    true
}

impl Default for FeatureFlagSnapshot {
    fn default() -> Self {
        Self::from_bits(ALL)
    }
}

impl FeatureFlagSnapshot {
    fn from_bits(bits: u8) -> Self {
        Self {
            enable_mutex_protection: bits & MUTEX_PROTECTION != 0,
            enable_risk_enforcement: bits & RISK_ENFORCEMENT != 0,
            enable_persistence: bits & PERSISTENCE != 0,
            enable_guarded_stop_loss: bits & GUARDED_STOP_LOSS != 0,
        }
    }

    fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.enable_mutex_protection {
            bits |= MUTEX_PROTECTION;
        }
        if self.enable_risk_enforcement {
            bits |= RISK_ENFORCEMENT;
        }
        if self.enable_persistence {
            bits |= PERSISTENCE;
        }
        if self.enable_guarded_stop_loss {
            bits |= GUARDED_STOP_LOSS;
        }
        bits
    }

    /// Copy with risk enforcement set to `on`.
    #[must_use]
    pub fn with_risk_enforcement(mut self, on: bool) -> Self {
        self.enable_risk_enforcement = on;
        self
    }

    /// Copy with persistence set to `on`.
    #[must_use]
    pub fn with_persistence(mut self, on: bool) -> Self {
        self.enable_persistence = on;
        self
    }

    /// Copy with guarded stop-loss set to `on`.
    #[must_use]
    pub fn with_guarded_stop_loss(mut self, on: bool) -> Self {
        self.enable_guarded_stop_loss = on;
        self
    }

    /// Copy with mutex protection set to `on`.
    #[must_use]
    pub fn with_mutex_protection(mut self, on: bool) -> Self {
        self.enable_mutex_protection = on;
        self
    }
}

/// Source of the current flag values.
pub trait FeatureFlags: Send + Sync {
    fn current(&self) -> FeatureFlagSnapshot;
}

/// Flags fixed for the lifetime of the value.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticFlags(pub FeatureFlagSnapshot);

impl FeatureFlags for StaticFlags {
    fn current(&self) -> FeatureFlagSnapshot {
        self.0
    }
}

/// Process-wide toggles, flipped at runtime by an operator.
///
/// Every change is logged; safety-relevant disables are logged at warn.
#[derive(Debug)]
pub struct RuntimeFlags {
    bits: AtomicU8,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self::new(FeatureFlagSnapshot::default())
    }
}

impl RuntimeFlags {
    #[must_use]
    pub fn new(initial: FeatureFlagSnapshot) -> Self {
        Self {
            bits: AtomicU8::new(initial.to_bits()),
        }
    }

    pub fn set_mutex_protection(&self, on: bool) {
        self.set_bit(MUTEX_PROTECTION, on, "enable_mutex_protection");
    }

    pub fn set_risk_enforcement(&self, on: bool) {
        self.set_bit(RISK_ENFORCEMENT, on, "enable_risk_enforcement");
    }

    pub fn set_persistence(&self, on: bool) {
        self.set_bit(PERSISTENCE, on, "enable_persistence");
    }

    pub fn set_guarded_stop_loss(&self, on: bool) {
        self.set_bit(GUARDED_STOP_LOSS, on, "enable_guarded_stop_loss");
    }

    fn set_bit(&self, bit: u8, on: bool, name: &'static str) {
        let old = if on {
            self.bits.fetch_or(bit, Ordering::SeqCst)
        } else {
            self.bits.fetch_and(!bit, Ordering::SeqCst)
        };
        let was_on = old & bit != 0;
        if was_on == on {
            return;
        }
        if on {
            info!(flag = name, "Feature flag enabled");
        } else {
            warn!(flag = name, "Feature flag disabled");
        }
    }
}

impl FeatureFlags for RuntimeFlags {
    fn current(&self) -> FeatureFlagSnapshot {
        FeatureFlagSnapshot::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
