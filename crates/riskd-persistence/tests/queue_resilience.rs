//! Persistence queue behaviour under storage failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use riskd_core::{
    AccountId, EnqueueResult, Money, PersistenceRecord, RecordStatus, RiskSnapshot, SnapshotCause,
};
use riskd_persistence::{
    AuditLog, FileSnapshotStore, LoadOutcome, MemorySnapshotStore, PersistenceQueue, QueueConfig,
    RetryPolicy, StoreError,
};

fn record(account: &str, seq: u64) -> PersistenceRecord {
    let mut snap = RiskSnapshot::fresh(AccountId::new(account), Money::new(dec!(10000)), Utc::now());
    snap.sequence = seq;
    snap.daily_pnl = Money::new(-Decimal::from(seq));
    PersistenceRecord::pending(snap, SnapshotCause::Mutation)
}

fn config(max_attempts: u32, backoff_ms: u64) -> QueueConfig {
    QueueConfig {
        partition_capacity: 256,
        retry: RetryPolicy::new(
            max_attempts,
            Duration::from_millis(backoff_ms),
            Duration::from_millis(backoff_ms * 4),
            Duration::ZERO,
        )
        .expect("valid policy"),
    }
}

/// 100 enqueues from four threads, spread over the window in which the store
/// fails twice and the worker backs off. Nothing waits on storage, nothing is
/// lost, and the newest snapshot ends up committed.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_enqueue_with_flaky_store() {
    let store = Arc::new(MemorySnapshotStore::new());
    store.fail_next(2, StoreError::Transient("connection reset".to_string()));
    store.set_latency(Duration::from_millis(30));
    let queue = Arc::new(PersistenceQueue::new(store.clone(), config(5, 20), None).expect("queue"));
    let account = AccountId::new("acct-flaky");
    let next = Arc::new(AtomicU64::new(0));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let next = Arc::clone(&next);
            tokio::task::spawn_blocking(move || {
                let mut slowest = Duration::ZERO;
                for _ in 0..25 {
                    let seq = next.fetch_add(1, Ordering::SeqCst) + 1;
                    let started = Instant::now();
                    let result = queue.enqueue(record("acct-flaky", seq));
                    slowest = slowest.max(started.elapsed());
                    // A racing producer may already have committed a newer one.
                    assert_ne!(result, EnqueueResult::Closed, "seq {seq}");
                    std::thread::sleep(Duration::from_millis(12));
                }
                slowest
            })
        })
        .collect();

    // The first enqueues are already pending when the store starts failing.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(store.upsert_calls() >= 1);
    assert_eq!(store.committed(&account), None);

    let mut slowest = Duration::ZERO;
    for p in producers {
        slowest = slowest.max(p.await.expect("producer"));
    }
    assert!(slowest < Duration::from_millis(100), "enqueue took {slowest:?}");

    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    let committed = store.committed(&account).expect("committed record");
    assert_eq!(committed.sequence, 100);
    assert_eq!(committed.status, RecordStatus::Committed);

    let upserts: Vec<u64> = store.upserts().into_iter().map(|(_, seq)| seq).collect();
    assert!(upserts.windows(2).all(|w| w[0] < w[1]), "{upserts:?}");
    assert_eq!(upserts.last(), Some(&100));

    let status = queue.partition_status(&account).expect("partition");
    assert_eq!(status.last_terminal, Some((100, RecordStatus::Committed)));
    assert_eq!(status.highest_committed, Some(100));

    // Every record is accounted for exactly once.
    let stats = queue.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.failed, 0);
    assert!(stats.superseded > 0);
    assert_eq!(stats.superseded + stats.committed + stats.stale, 100);
}

/// A record stuck in retry gives way to a newer one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_newer_snapshot_supersedes_retrying_one() {
    let store = Arc::new(MemorySnapshotStore::new());
    store.set_unavailable(true);
    let queue = PersistenceQueue::new(store.clone(), config(200, 5), None).expect("queue");
    let account = AccountId::new("acct-outage");

    queue.enqueue(record("acct-outage", 1));
    tokio::time::sleep(Duration::from_millis(30)).await;
    for seq in 2..=5 {
        queue.enqueue(record("acct-outage", seq));
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    store.set_unavailable(false);

    assert!(queue.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(store.upserts(), vec![(account.clone(), 5)]);
    assert_eq!(queue.stats().failed, 0);
}

/// One account's permanent failure does not hold up another account.
#[tokio::test]
async fn test_failing_account_is_isolated() {
    let store = Arc::new(MemorySnapshotStore::new());
    let broken = AccountId::new("acct-broken");
    store.fail_account(broken.clone(), StoreError::Permanent("schema mismatch".to_string()));
    let queue = PersistenceQueue::new(store.clone(), config(5, 1), None).expect("queue");

    queue.enqueue(record("acct-broken", 1));
    queue.enqueue(record("acct-healthy", 1));
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    let status = queue.partition_status(&broken).expect("partition");
    assert_eq!(status.last_terminal, Some((1, RecordStatus::Failed)));
    assert!(store.committed(&broken).is_none());
    assert!(store.committed(&AccountId::new("acct-healthy")).is_some());
    assert_eq!(queue.stats().failed, 1);
    assert_eq!(store.upsert_calls(), 2);
}

/// With the store down, shutdown gives up at the deadline and reports what
/// was left behind.
#[tokio::test]
async fn test_shutdown_reports_unflushed_records() {
    let store = Arc::new(MemorySnapshotStore::new());
    store.set_unavailable(true);
    let queue = PersistenceQueue::new(store.clone(), config(1000, 20), None).expect("queue");

    queue.enqueue(record("a", 1));
    queue.enqueue(record("b", 1));
    queue.enqueue(record("b", 2));

    let report = queue.shutdown(Duration::from_millis(100)).await;
    assert!(!report.drained);
    assert!(report.unflushed >= 2, "report: {report:?}");
    assert_eq!(queue.unflushed_count(), report.unflushed);
    assert_eq!(queue.enqueue(record("a", 2)), EnqueueResult::Closed);
}

/// The audit stream keeps every drained snapshot, superseded ones included.
#[tokio::test]
async fn test_audit_stream_is_uncoalesced() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let audit = Arc::new(AuditLog::new(dir.path().join("audit")).expect("audit"));
    let store = Arc::new(MemorySnapshotStore::new());
    let queue =
        PersistenceQueue::new(store.clone(), config(3, 1), Some(Arc::clone(&audit))).expect("queue");

    for seq in 1..=5 {
        queue.enqueue(record("acct-audit", seq));
    }
    assert!(queue.wait_idle(Duration::from_secs(5)).await);

    let entries = audit.read_all().expect("read audit");
    let mut seqs: Vec<u64> = entries.iter().map(|e| e.record.sequence).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(entries.iter().filter(|e| e.superseded).count(), 4);
    assert_eq!(store.upserts().len(), 1);
}

/// Snapshots committed to a file store come back after a restart.
#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let account = AccountId::new("acct-file");
    let written = record("acct-file", 7);

    {
        let store = Arc::new(FileSnapshotStore::new(dir.path()).expect("store"));
        let queue = PersistenceQueue::new(store, config(3, 1), None).expect("queue");
        queue.enqueue(written.clone());
        let report = queue.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.unflushed, 0);
    }

    let store = Arc::new(FileSnapshotStore::new(dir.path()).expect("store"));
    let queue = PersistenceQueue::new(store, config(3, 1), None).expect("queue");
    match queue.load_latest(&account, Duration::from_secs(1)).await {
        LoadOutcome::Found(r) => {
            assert_eq!(r.snapshot, written.snapshot);
            assert_eq!(r.status, RecordStatus::Committed);
        }
        other => panic!("expected Found, got {other:?}"),
    }
    assert_eq!(queue.enqueue(record("acct-file", 7)), EnqueueResult::Stale);
}
