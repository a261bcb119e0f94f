//! Main application orchestration.
//!
//! Wires the components together:
//! - Snapshot store and persistence queue (with optional audit stream)
//! - Risk engine with the queue as its snapshot sink
//! - Runtime feature flags
//! - Startup recovery and shutdown drain
//!
//! Accounts that start conservatively because the store was unreachable are
//! reconciled with the stored state once it can be read: before an operator
//! resume, and on every status tick while any remain.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use riskd_core::{
    AccountId, FeatureFlags, PersistenceRecord, RiskSnapshot, RuntimeFlags, SnapshotCause,
    SnapshotSink,
};
use riskd_executor::{DynStopLossPlacer, TradeGuard};
use riskd_persistence::{
    AuditLog, DynSnapshotStore, FileSnapshotStore, LoadOutcome, MemorySnapshotStore,
    PersistenceQueue, ShutdownReport,
};
use riskd_risk::{MutationStrategy, RiskEngine, RiskState};

use crate::config::{AppConfig, PersistenceBackend};
use crate::error::AppResult;

/// Queue status log interval.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// How each configured account came up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Continued from a committed snapshot.
    pub restored: Vec<AccountId>,
    /// No snapshot stored; started fresh.
    pub fresh: Vec<AccountId>,
    /// Store unreachable; paused until operator resume.
    pub conservative: Vec<AccountId>,
}

/// Main application.
pub struct Application {
    config: AppConfig,
    flags: Arc<RuntimeFlags>,
    queue: Arc<PersistenceQueue>,
    engine: Arc<RiskEngine>,
    /// Conservatively started accounts whose stored state is not merged yet.
    unreconciled: Mutex<BTreeSet<AccountId>>,
}

impl Application {
    /// Create the application with the store selected in `config`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let store: DynSnapshotStore = match config.persistence.backend {
            PersistenceBackend::Memory => Arc::new(MemorySnapshotStore::new()),
            PersistenceBackend::File => {
                Arc::new(FileSnapshotStore::new(&config.persistence.data_dir)?)
            }
        };
        Self::with_store(config, store)
    }

    /// Create the application over an explicit store.
    pub fn with_store(config: AppConfig, store: DynSnapshotStore) -> AppResult<Self> {
        config.validate()?;

        let audit = match config.persistence.audit_dir() {
            Some(dir) => Some(Arc::new(AuditLog::new(dir)?)),
            None => None,
        };
        let queue = Arc::new(PersistenceQueue::new(
            store,
            config.queue_config()?,
            audit,
        )?);
        let sink: Arc<dyn SnapshotSink> = queue.clone();
        let engine = Arc::new(RiskEngine::new(config.thresholds()?).with_sink(sink));
        let flags = Arc::new(RuntimeFlags::new(config.flags));

        info!(
            accounts = config.accounts.len(),
            backend = ?config.persistence.backend,
            max_daily_loss = %config.risk.max_daily_loss,
            max_drawdown = %config.risk.max_drawdown,
            pause_cooldown_secs = config.risk.pause_cooldown_secs,
            "Application initialized"
        );

        Ok(Self {
            config,
            flags,
            queue,
            engine,
            unreconciled: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<RiskEngine> {
        &self.engine
    }

    pub fn flags(&self) -> &Arc<RuntimeFlags> {
        &self.flags
    }

    pub fn queue(&self) -> &Arc<PersistenceQueue> {
        &self.queue
    }

    /// Conservatively started accounts still waiting for the store.
    #[must_use]
    pub fn unreconciled(&self) -> Vec<AccountId> {
        self.unreconciled.lock().iter().cloned().collect()
    }

    /// Trade guard over this application's engine and the given placer.
    pub fn trade_guard(&self, placer: DynStopLossPlacer) -> TradeGuard {
        TradeGuard::new(
            Arc::clone(&self.engine),
            placer,
            self.config.guard.placement_timeout(),
        )
    }

    /// Load the latest snapshot for every configured account and register it.
    ///
    /// - Found: continue from the stored state
    /// - Not found: fresh state, trading allowed
    /// - Store unavailable or too slow: paused until an operator resumes
    pub async fn recover(&self) -> AppResult<RecoverySummary> {
        let timeout = self.config.persistence.startup_timeout();
        let start_equity = self.config.start_equity();
        let strategy = MutationStrategy::from_flags(&self.flags.current());
        let mut summary = RecoverySummary::default();

        for account in self.config.account_ids()? {
            match self.queue.load_latest(&account, timeout).await {
                LoadOutcome::Found(record) => {
                    info!(
                        account = %account,
                        seq = record.sequence,
                        paused = record.snapshot.paused_until.is_some(),
                        "Recovered risk state"
                    );
                    self.engine
                        .register(RiskState::restore(record.snapshot).with_strategy(strategy))?;
                    summary.restored.push(account);
                }
                LoadOutcome::NotFound => {
                    info!(account = %account, %start_equity, "No stored state, starting fresh");
                    let state = RiskState::new(account.clone(), start_equity).with_strategy(strategy);
                    let snapshot = state.snapshot();
                    self.engine.register(state)?;
                    if self.flags.current().enable_persistence {
                        let result = self
                            .queue
                            .enqueue(PersistenceRecord::pending(snapshot, SnapshotCause::Recovery));
                        if !result.is_accepted() {
                            warn!(account = %account, ?result, "Initial snapshot not queued");
                        }
                    }
                    summary.fresh.push(account);
                }
                LoadOutcome::Unavailable(reason) => {
                    error!(
                        account = %account,
                        reason = %reason,
                        "Risk state unavailable, pausing account until operator resume"
                    );
                    self.engine.register(
                        RiskState::conservative(account.clone(), start_equity)
                            .with_strategy(strategy),
                    )?;
                    self.unreconciled.lock().insert(account.clone());
                    summary.conservative.push(account);
                }
            }
        }

        info!(
            restored = summary.restored.len(),
            fresh = summary.fresh.len(),
            conservative = summary.conservative.len(),
            "Startup recovery complete"
        );
        Ok(summary)
    }

    /// Merge stored state into every conservatively started account whose
    /// store can now be read. Returns the accounts still waiting.
    pub async fn reconcile_pending(&self) -> AppResult<Vec<AccountId>> {
        for account in self.unreconciled() {
            self.reconcile_account(&account).await?;
        }
        Ok(self.unreconciled())
    }

    /// Returns true once `account` no longer waits for the store.
    async fn reconcile_account(&self, account: &AccountId) -> AppResult<bool> {
        if !self.unreconciled.lock().contains(account) {
            return Ok(true);
        }
        let timeout = self.config.persistence.startup_timeout();
        let stored = match self.queue.load_latest(account, timeout).await {
            LoadOutcome::Found(record) => Some(record.snapshot),
            LoadOutcome::NotFound => None,
            LoadOutcome::Unavailable(reason) => {
                warn!(account = %account, reason = %reason, "Stored risk state still unavailable");
                return Ok(false);
            }
        };
        // A concurrent caller may have merged it while the load was running.
        if !self.unreconciled.lock().remove(account) {
            return Ok(true);
        }
        match stored {
            Some(snapshot) => {
                self.engine.reconcile(&snapshot, &self.flags.current())?;
            }
            None => info!(account = %account, "Store reachable with no stored state, nothing to merge"),
        }
        Ok(true)
    }

    /// Operator resume.
    ///
    /// A conservatively started account is first reconciled with the store,
    /// so its sequence continues above the stored one and later snapshots
    /// are not superseded by state from before the restart.
    pub async fn resume(&self, account: &AccountId) -> AppResult<RiskSnapshot> {
        if !self.reconcile_account(account).await? {
            warn!(
                account = %account,
                "Resuming before the stored risk state could be read"
            );
        }
        Ok(self.engine.resume(account, &self.flags.current())?)
    }

    /// Run until ctrl-c, then drain the queue.
    pub async fn run(&self) -> AppResult<ShutdownReport> {
        let mut status = tokio::time::interval(STATUS_INTERVAL);
        status.tick().await;

        loop {
            tokio::select! {
                _ = status.tick() => {
                    let stats = self.queue.stats();
                    info!(
                        pending = stats.pending,
                        in_flight = stats.in_flight,
                        committed = stats.committed,
                        failed = stats.failed,
                        retries = stats.retries,
                        "Persistence status"
                    );
                    match self.reconcile_pending().await {
                        Ok(waiting) if !waiting.is_empty() => {
                            warn!(accounts = ?waiting, "Accounts still waiting for stored risk state");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reconciling stored risk state failed"),
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("Shutdown signal received"),
                        Err(e) => error!(?e, "Failed to listen for shutdown signal"),
                    }
                    break;
                }
            }
        }

        Ok(self.shutdown().await)
    }

    /// Stop accepting snapshots and drain what is pending.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self
            .queue
            .shutdown(self.config.persistence.shutdown_timeout())
            .await;
        if report.unflushed > 0 {
            warn!(
                unflushed = report.unflushed,
                "Shutdown left risk snapshots unflushed"
            );
        } else {
            info!("Shutdown complete, all risk snapshots flushed");
        }
        report
    }
}
