//! Application configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use riskd_core::{AccountId, FeatureFlagSnapshot, Money, RiskThresholds};
use riskd_persistence::{QueueConfig, RetryPolicy};

use crate::error::{AppError, AppResult};

/// Risk limits and the equity new accounts start the day with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Daily loss limit (positive amount). Default: 1000.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    /// Drawdown limit from intraday peak equity (positive amount). Default: 2000.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: Decimal,
    /// Pause length after a breach (seconds). 0 pauses until operator resume.
    /// Default: 3600.
    #[serde(default = "default_pause_cooldown_secs")]
    pub pause_cooldown_secs: u64,
    /// Session start equity for accounts with no stored snapshot. Default: 10000.
    #[serde(default = "default_start_equity")]
    pub start_equity: Decimal,
}

fn default_max_daily_loss() -> Decimal {
    Decimal::from(1000)
}

fn default_max_drawdown() -> Decimal {
    Decimal::from(2000)
}

fn default_pause_cooldown_secs() -> u64 {
    3600
}

fn default_start_equity() -> Decimal {
    Decimal::from(10_000)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_drawdown: default_max_drawdown(),
            pause_cooldown_secs: default_pause_cooldown_secs(),
            start_equity: default_start_equity(),
        }
    }
}

/// Durable store selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    /// In-process map. Lost on restart.
    Memory,
    /// One JSON file per account under `data_dir`.
    #[default]
    File,
}

/// Persistence queue and store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,
    /// Snapshot directory for the file backend. Default: "data/snapshots".
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Audit stream directory. Unset disables the audit stream.
    #[serde(default)]
    pub audit_path: Option<String>,
    /// Pending records per account before coalescing. Default: 64.
    #[serde(default = "default_partition_capacity")]
    pub partition_capacity: usize,
    /// Commit attempts per record. Default: 8.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry backoff (ms). Default: 100.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Backoff cap (ms). Default: 5000.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Random jitter added to each backoff (ms). Default: 50.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Per-account `load_latest` budget at startup (ms). Default: 5000.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Drain budget at shutdown (ms). Default: 10000.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_data_dir() -> String {
    "data/snapshots".to_string()
}

fn default_partition_capacity() -> usize {
    64
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_jitter_ms() -> u64 {
    50
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            data_dir: default_data_dir(),
            audit_path: None,
            partition_capacity: default_partition_capacity(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ms: default_jitter_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl PersistenceConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn audit_dir(&self) -> Option<PathBuf> {
        self.audit_path.as_ref().map(PathBuf::from)
    }
}

/// Trade guard configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Stop-loss placement budget (ms). Default: 2000.
    #[serde(default = "default_placement_timeout_ms")]
    pub placement_timeout_ms: u64,
}

fn default_placement_timeout_ms() -> u64 {
    2_000
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            placement_timeout_ms: default_placement_timeout_ms(),
        }
    }
}

impl GuardConfig {
    pub fn placement_timeout(&self) -> Duration {
        Duration::from_millis(self.placement_timeout_ms)
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Accounts recovered at startup.
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub risk: RiskConfig,
    /// Initial feature flags. All enabled by default.
    #[serde(default)]
    pub flags: FeatureFlagSnapshot,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub guard: GuardConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        self.thresholds()?;
        self.queue_config()?;

        if self.risk.start_equity <= Decimal::ZERO {
            return Err(AppError::Config(format!(
                "risk.start_equity must be > 0, got {}",
                self.risk.start_equity
            )));
        }
        if self.persistence.backend == PersistenceBackend::File
            && self.persistence.data_dir.trim().is_empty()
        {
            return Err(AppError::Config(
                "persistence.data_dir is required for the file backend".to_string(),
            ));
        }
        if self.persistence.startup_timeout_ms == 0 {
            return Err(AppError::Config(
                "persistence.startup_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.guard.placement_timeout_ms == 0 {
            return Err(AppError::Config(
                "guard.placement_timeout_ms must be > 0".to_string(),
            ));
        }

        let accounts = self.account_ids()?;
        let mut seen = HashSet::new();
        for account in &accounts {
            if !seen.insert(account) {
                return Err(AppError::Config(format!("Duplicate account: {account}")));
            }
        }
        Ok(())
    }

    /// Validated risk thresholds.
    pub fn thresholds(&self) -> AppResult<RiskThresholds> {
        RiskThresholds::new(
            Money::new(self.risk.max_daily_loss),
            Money::new(self.risk.max_drawdown),
            Duration::from_secs(self.risk.pause_cooldown_secs),
        )
        .map_err(|e| AppError::Config(e.to_string()))
    }

    /// Validated queue tuning.
    pub fn queue_config(&self) -> AppResult<QueueConfig> {
        let p = &self.persistence;
        if p.partition_capacity == 0 {
            return Err(AppError::Config(
                "persistence.partition_capacity must be at least 1".to_string(),
            ));
        }
        let retry = RetryPolicy::new(
            p.max_attempts,
            Duration::from_millis(p.base_backoff_ms),
            Duration::from_millis(p.max_backoff_ms),
            Duration::from_millis(p.jitter_ms),
        )
        .map_err(|e| AppError::Config(e.to_string()))?;
        Ok(QueueConfig {
            partition_capacity: p.partition_capacity,
            retry,
        })
    }

    /// Configured accounts, parsed.
    pub fn account_ids(&self) -> AppResult<Vec<AccountId>> {
        self.accounts
            .iter()
            .map(|s| {
                s.parse::<AccountId>()
                    .map_err(|e| AppError::Config(e.to_string()))
            })
            .collect()
    }

    pub fn start_equity(&self) -> Money {
        Money::new(self.risk.start_equity)
    }
}
