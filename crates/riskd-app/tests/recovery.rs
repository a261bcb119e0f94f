//! Startup recovery and shutdown drain through the assembled application.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal_macros::dec;

use riskd_app::{AppConfig, Application, PersistenceBackend};
use riskd_core::{
    AccountId, FeatureFlags, Money, PauseDeadline, PersistenceRecord, RecordStatus, RiskSnapshot,
    SnapshotCause,
};
use riskd_persistence::MemorySnapshotStore;
use riskd_risk::MutationStrategy;

fn config(accounts: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    config.accounts = accounts.iter().map(|a| a.to_string()).collect();
    config.risk.max_daily_loss = dec!(500);
    config.risk.max_drawdown = dec!(1500);
    config.risk.start_equity = dec!(20000);
    config.persistence.backend = PersistenceBackend::Memory;
    config.persistence.base_backoff_ms = 1;
    config.persistence.max_backoff_ms = 4;
    config.persistence.jitter_ms = 0;
    config.persistence.startup_timeout_ms = 200;
    config.persistence.shutdown_timeout_ms = 1000;
    config
}

fn committed(account: &str) -> PersistenceRecord {
    let now = Utc::now();
    let mut snap = RiskSnapshot::fresh(AccountId::new(account), Money::new(dec!(20000)), now);
    snap.daily_pnl = Money::new(dec!(-350));
    snap.current_drawdown = Money::new(dec!(350));
    snap.sequence = 42;
    snap.paused_until = Some(PauseDeadline::Until(now + chrono::Duration::minutes(30)));
    PersistenceRecord::pending(snap, SnapshotCause::Mutation).with_status(RecordStatus::Committed)
}

/// A committed snapshot comes back exactly, pause included.
#[tokio::test]
async fn test_recovery_restores_committed_snapshot() {
    let store = Arc::new(MemorySnapshotStore::new());
    let stored = committed("desk-1");
    store.insert(stored.clone());

    let app = Application::with_store(config(&["desk-1"]), store.clone()).expect("app");
    let summary = app.recover().await.expect("recover");
    assert_eq!(summary.restored, vec![AccountId::new("desk-1")]);

    let account = AccountId::new("desk-1");
    let snapshot = app.engine().snapshot(&account).expect("registered");
    assert_eq!(snapshot, stored.snapshot);
    assert!(!app.engine().can_trade(&account, &app.flags().current()));

    // The next mutation continues the sequence and is committed over the
    // recovered record.
    let update = app
        .engine()
        .apply_pnl(&account, Money::new(dec!(50)), &app.flags().current())
        .expect("apply");
    assert_eq!(update.snapshot.sequence, 43);

    let report = app.shutdown().await;
    assert_eq!(report.unflushed, 0);
    assert_eq!(store.committed(&account).map(|r| r.sequence), Some(43));
}

/// Store down at startup: the account comes up paused until resumed.
#[tokio::test]
async fn test_unavailable_store_starts_paused() {
    let store = Arc::new(MemorySnapshotStore::new());
    store.set_unavailable(true);

    let app = Application::with_store(config(&["desk-2"]), store.clone()).expect("app");
    let summary = app.recover().await.expect("recover");
    let account = AccountId::new("desk-2");
    assert_eq!(summary.conservative, vec![account.clone()]);

    let flags = app.flags().current();
    let snapshot = app.engine().snapshot(&account).expect("registered");
    assert_eq!(snapshot.paused_until, Some(PauseDeadline::Indefinite));
    assert!(!app.engine().can_trade(&account, &flags));

    app.resume(&account).await.expect("resume");
    assert!(app.engine().can_trade(&account, &flags));
    assert_eq!(app.unreconciled(), vec![account.clone()]);

    store.set_unavailable(false);
    let report = app.shutdown().await;
    assert_eq!(report.unflushed, 0);
}

/// Store down at startup and back before the operator resumes: the resumed
/// account continues above the stored sequence and its later updates reach
/// the store instead of being dropped under the pre-outage record.
#[tokio::test]
async fn test_resume_after_outage_continues_above_stored_state() {
    let store = Arc::new(MemorySnapshotStore::new());
    let account = AccountId::new("desk-6");
    let mut before = RiskSnapshot::fresh(account.clone(), Money::new(dec!(20000)), Utc::now());
    before.daily_pnl = Money::new(dec!(-300));
    before.current_drawdown = Money::new(dec!(300));
    before.sequence = 500;
    store.insert(PersistenceRecord::pending(before, SnapshotCause::Mutation));
    store.set_unavailable(true);

    let app = Application::with_store(config(&["desk-6"]), store.clone()).expect("app");
    let summary = app.recover().await.expect("recover");
    assert_eq!(summary.conservative, vec![account.clone()]);

    store.set_unavailable(false);
    let resumed = app.resume(&account).await.expect("resume");
    assert!(resumed.sequence > 500);
    assert_eq!(resumed.daily_pnl, Money::new(dec!(-300)));
    assert!(app.unreconciled().is_empty());

    let flags = app.flags().current();
    assert!(app.engine().can_trade(&account, &flags));
    let update = app
        .engine()
        .apply_pnl(&account, Money::new(dec!(-100)), &flags)
        .expect("apply");
    assert_eq!(update.snapshot.daily_pnl, Money::new(dec!(-400)));

    assert!(app.queue().wait_idle(Duration::from_secs(2)).await);
    let status = app.queue().partition_status(&account).expect("partition");
    assert_eq!(
        status.last_terminal,
        Some((update.snapshot.sequence, RecordStatus::Committed))
    );
    let stored = store.committed(&account).expect("stored");
    assert_eq!(stored.sequence, update.snapshot.sequence);
    assert_eq!(stored.snapshot.daily_pnl, Money::new(dec!(-400)));
    app.shutdown().await;

    // A restart now sees the post-outage state.
    let app = Application::with_store(config(&["desk-6"]), store.clone()).expect("app");
    app.recover().await.expect("recover");
    assert_eq!(app.engine().snapshot(&account).expect("registered"), update.snapshot);
    app.shutdown().await;
}

/// The periodic reconcile merges stored state but leaves the operator pause.
#[tokio::test]
async fn test_reconcile_pending_keeps_conservative_pause() {
    let store = Arc::new(MemorySnapshotStore::new());
    let account = AccountId::new("desk-7");
    let mut before = RiskSnapshot::fresh(account.clone(), Money::new(dec!(20000)), Utc::now());
    before.sequence = 40;
    store.insert(PersistenceRecord::pending(before, SnapshotCause::Mutation));
    store.set_unavailable(true);

    let app = Application::with_store(config(&["desk-7"]), store.clone()).expect("app");
    app.recover().await.expect("recover");
    assert_eq!(app.reconcile_pending().await.expect("reconcile"), vec![account.clone()]);

    store.set_unavailable(false);
    assert!(app.reconcile_pending().await.expect("reconcile").is_empty());

    let snapshot = app.engine().snapshot(&account).expect("registered");
    assert!(snapshot.sequence > 40);
    assert_eq!(snapshot.paused_until, Some(PauseDeadline::Indefinite));
    assert!(!app.engine().can_trade(&account, &app.flags().current()));

    let report = app.shutdown().await;
    assert_eq!(report.unflushed, 0);
    assert_eq!(store.committed(&account).map(|r| r.sequence), Some(snapshot.sequence));
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// With mutex protection switched off, a normal build warns and keeps the
/// synchronized ledger.
#[tokio::test]
async fn test_mutex_protection_off_stays_synchronized() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut cfg = config(&["desk-8"]);
    cfg.flags.enable_mutex_protection = false;
    let app = Application::with_store(cfg, Arc::new(MemorySnapshotStore::new())).expect("app");
    app.recover().await.expect("recover");

    let account = AccountId::new("desk-8");
    assert_eq!(
        app.engine().strategy(&account).expect("registered"),
        MutationStrategy::Synchronized
    );
    let out = String::from_utf8(captured.0.lock().clone()).expect("utf8");
    assert!(out.contains("Mutex protection flag is off"), "log output: {out}");
    assert!(out.contains("WARN"));
    app.shutdown().await;
}

/// No stored snapshot: fresh state, trading allowed, initial state persisted.
#[tokio::test]
async fn test_missing_snapshot_starts_fresh() {
    let store = Arc::new(MemorySnapshotStore::new());
    let app = Application::with_store(config(&["desk-3"]), store.clone()).expect("app");

    let summary = app.recover().await.expect("recover");
    let account = AccountId::new("desk-3");
    assert_eq!(summary.fresh, vec![account.clone()]);
    assert!(app.engine().can_trade(&account, &app.flags().current()));

    let snapshot = app.engine().snapshot(&account).expect("registered");
    assert_eq!(snapshot.session_start_equity, Money::new(dec!(20000)));
    assert_eq!(snapshot.paused_until, None);

    assert!(app.queue().wait_idle(Duration::from_secs(2)).await);
    let stored = store.committed(&account).expect("initial snapshot stored");
    assert_eq!(stored.cause, SnapshotCause::Recovery);
    assert_eq!(stored.snapshot, snapshot);
}

/// A breach survives a restart of the file-backed daemon.
#[tokio::test]
async fn test_breach_survives_restart_with_file_store() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mut cfg = config(&["desk-4"]);
    cfg.persistence.backend = PersistenceBackend::File;
    cfg.persistence.data_dir = dir.path().join("snapshots").display().to_string();
    cfg.persistence.audit_path = Some(dir.path().join("audit").display().to_string());
    let account = AccountId::new("desk-4");

    let breached = {
        let app = Application::new(cfg.clone()).expect("app");
        app.recover().await.expect("recover");
        let update = app
            .engine()
            .apply_pnl(&account, Money::new(dec!(-600)), &app.flags().current())
            .expect("apply");
        assert!(update.breached());
        let report = app.shutdown().await;
        assert!(report.drained);
        assert_eq!(report.unflushed, 0);
        update.snapshot
    };

    let app = Application::new(cfg).expect("app");
    let summary = app.recover().await.expect("recover");
    assert_eq!(summary.restored, vec![account.clone()]);
    assert_eq!(app.engine().snapshot(&account).expect("registered"), breached);
    assert!(!app.engine().can_trade(&account, &app.flags().current()));
    app.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_fails_startup() {
    let mut cfg = config(&["desk-5"]);
    cfg.risk.max_drawdown = dec!(0);
    let store = Arc::new(MemorySnapshotStore::new());
    assert!(Application::with_store(cfg, store).is_err());

    assert!(AppConfig::from_toml_str("[risk]\nmax_daily_loss = \"-1\"\n").is_err());
}
