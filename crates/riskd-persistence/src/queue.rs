//! Partitioned persistence queue for risk snapshots.
//!
//! One partition per account. `enqueue` is a short critical section plus a
//! wake-up and never touches storage. Each partition has a single worker task
//! that commits its records in sequence order, so accounts commit in
//! parallel while each account stays ordered.
//!
//! The worker always commits the newest pending snapshot: older drained
//! records are superseded, and a record stuck in retry is superseded as soon
//! as a newer one arrives. Records at or below the committed high-water mark
//! are rejected, both at enqueue and again right before the commit. A store
//! that already holds a newer record fails the commit rather than reporting it
//! as committed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use riskd_core::{AccountId, EnqueueResult, PersistenceRecord, RecordStatus, SnapshotSink};
use riskd_telemetry::Metrics;

use crate::audit::{AuditEntry, AuditLog};
use crate::error::{PersistenceError, PersistenceResult};
use crate::retry::RetryPolicy;
use crate::store::{DynSnapshotStore, UpsertOutcome};

// ============================================================================
// Public types
// ============================================================================

/// Queue tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Pending records per partition before coalescing to the newest.
    pub partition_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partition_capacity: 64,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a startup `load_latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Found(PersistenceRecord),
    NotFound,
    /// Store errored or did not answer in time.
    Unavailable(String),
}

/// Queue-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub enqueued: u64,
    pub coalesced: u64,
    pub superseded: u64,
    pub stale: u64,
    pub committed: u64,
    pub failed: u64,
    pub retries: u64,
    pub audit_failures: u64,
}

/// Per-account view of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    pub account: AccountId,
    pub pending: usize,
    pub in_flight: Option<u64>,
    /// Committed high-water mark.
    pub highest_committed: Option<u64>,
    /// Sequence and outcome of the last record to reach a terminal state.
    pub last_terminal: Option<(u64, RecordStatus)>,
    pub last_error: Option<String>,
}

/// Outcome of `shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Records still pending or in flight when workers stopped.
    pub unflushed: usize,
    /// True if every worker finished before the deadline.
    pub drained: bool,
}

// ============================================================================
// Partition
// ============================================================================

#[derive(Debug, Default)]
struct PartitionState {
    pending: BTreeMap<u64, PersistenceRecord>,
    in_flight: Option<u64>,
    highest_committed: Option<u64>,
    last_terminal: Option<(u64, RecordStatus)>,
    last_error: Option<String>,
    worker_started: bool,
}

impl PartitionState {
    fn is_stale(&self, sequence: u64) -> bool {
        self.highest_committed.is_some_and(|h| sequence <= h)
    }

    fn unflushed(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    fn finish(&mut self, sequence: u64, status: RecordStatus) {
        self.in_flight = None;
        self.last_terminal = Some((sequence, status));
        if status == RecordStatus::Committed {
            self.highest_committed = Some(self.highest_committed.map_or(sequence, |h| h.max(sequence)));
            self.last_error = None;
        }
    }
}

#[derive(Debug)]
struct Partition {
    account: AccountId,
    state: Mutex<PartitionState>,
    notify: Notify,
}

impl Partition {
    fn new(account: AccountId) -> Self {
        Self {
            account,
            state: Mutex::new(PartitionState::default()),
            notify: Notify::new(),
        }
    }

    /// Take every pending record; the newest becomes in flight.
    ///
    /// Returns `(newest, older)`, or `None` if nothing is pending.
    fn drain(&self) -> Option<(PersistenceRecord, Vec<PersistenceRecord>)> {
        let mut st = self.state.lock();
        let (_, newest) = st.pending.pop_last()?;
        let older: Vec<_> = std::mem::take(&mut st.pending).into_values().collect();
        st.in_flight = Some(newest.sequence);
        Some((newest, older))
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    superseded: AtomicU64,
    stale: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    audit_failures: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

// ============================================================================
// PersistenceQueue
// ============================================================================

struct QueueInner {
    store: DynSnapshotStore,
    audit: Option<Arc<AuditLog>>,
    config: QueueConfig,
    partitions: DashMap<AccountId, Arc<Partition>>,
    runtime: Handle,
    closed: AtomicBool,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

/// Asynchronous, partitioned mirror of risk snapshots into a `SnapshotStore`.
///
/// Thread-safe: share via `Arc<PersistenceQueue>`. Must be created inside a
/// Tokio runtime; workers are spawned on that runtime.
pub struct PersistenceQueue {
    inner: Arc<QueueInner>,
}

impl PersistenceQueue {
    pub fn new(
        store: DynSnapshotStore,
        config: QueueConfig,
        audit: Option<Arc<AuditLog>>,
    ) -> PersistenceResult<Self> {
        if config.partition_capacity == 0 {
            return Err(PersistenceError::InvalidConfig(
                "partition_capacity must be at least 1".to_string(),
            ));
        }
        let runtime = Handle::try_current()
            .map_err(|e| PersistenceError::InvalidConfig(format!("no Tokio runtime: {e}")))?;

        info!(
            store = store.name(),
            capacity = config.partition_capacity,
            max_attempts = config.retry.max_attempts,
            audit = audit.is_some(),
            "Persistence queue started"
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                audit,
                config,
                partitions: DashMap::new(),
                runtime,
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        })
    }

    fn partition(&self, account: &AccountId) -> Arc<Partition> {
        if let Some(p) = self.inner.partitions.get(account) {
            return Arc::clone(p.value());
        }
        Arc::clone(
            self.inner
                .partitions
                .entry(account.clone())
                .or_insert_with(|| Arc::new(Partition::new(account.clone())))
                .value(),
        )
    }

    /// Hand a record to its account's partition. Never blocks on storage.
    pub fn enqueue(&self, record: PersistenceRecord) -> EnqueueResult {
        if self.inner.closed.load(Ordering::SeqCst) {
            Metrics::persist_enqueued("closed");
            return EnqueueResult::Closed;
        }

        let partition = self.partition(&record.account);
        let sequence = record.sequence;
        let capacity = self.inner.config.partition_capacity;
        let mut backlog_delta: i64 = 0;

        let (result, spawn) = {
            let mut st = partition.state.lock();
            if st.is_stale(sequence) {
                (EnqueueResult::Stale, false)
            } else {
                let replacing = st.pending.contains_key(&sequence);
                let result = if !replacing && st.pending.len() >= capacity {
                    st.pending.insert(sequence, record);
                    let dropped = st.pending.len() - 1;
                    if let Some((seq, newest)) = st.pending.pop_last() {
                        st.pending.clear();
                        st.pending.insert(seq, newest);
                    }
                    backlog_delta -= dropped as i64 - 1;
                    bump(&self.inner.counters.coalesced, dropped as u64);
                    EnqueueResult::Coalesced
                } else {
                    st.pending.insert(sequence, record);
                    if !replacing {
                        backlog_delta += 1;
                    }
                    EnqueueResult::Queued
                };
                let spawn = !st.worker_started;
                st.worker_started = true;
                (result, spawn)
            }
        };

        match result {
            EnqueueResult::Stale => {
                bump(&self.inner.counters.stale, 1);
                Metrics::persist_enqueued("stale");
                Metrics::persist_stale(1);
                debug!(account = %partition.account, seq = sequence, "Stale snapshot rejected at enqueue");
                return result;
            }
            EnqueueResult::Coalesced => {
                Metrics::persist_enqueued("coalesced");
                warn!(
                    account = %partition.account,
                    seq = sequence,
                    capacity,
                    "Partition full, coalesced to newest snapshot"
                );
            }
            _ => Metrics::persist_enqueued("queued"),
        }
        bump(&self.inner.counters.enqueued, 1);
        Metrics::persist_backlog_add(backlog_delta);

        if spawn {
            let handle = self
                .inner
                .runtime
                .spawn(run_partition(Arc::clone(&self.inner), Arc::clone(&partition)));
            self.inner.workers.lock().push(handle);
            debug!(account = %partition.account, "Partition worker spawned");
        }
        partition.notify.notify_one();
        trace!(account = %partition.account, seq = sequence, ?result, "Snapshot enqueued");
        result
    }

    /// Latest committed record for `account`, bounded by `timeout`.
    ///
    /// A found record also seeds the partition's high-water mark, so older
    /// snapshots from before the restart cannot overwrite it.
    pub async fn load_latest(&self, account: &AccountId, timeout: Duration) -> LoadOutcome {
        let store = &self.inner.store;
        match tokio::time::timeout(timeout, store.load_latest(account)).await {
            Ok(Ok(Some(record))) => {
                {
                    let partition = self.partition(account);
                    let mut st = partition.state.lock();
                    st.highest_committed =
                        Some(st.highest_committed.map_or(record.sequence, |h| h.max(record.sequence)));
                }
                info!(account = %account, seq = record.sequence, "Loaded latest snapshot");
                LoadOutcome::Found(record)
            }
            Ok(Ok(None)) => {
                info!(account = %account, "No stored snapshot");
                LoadOutcome::NotFound
            }
            Ok(Err(e)) => {
                warn!(account = %account, error = %e, "Snapshot store unavailable at load");
                LoadOutcome::Unavailable(e.to_string())
            }
            Err(_) => {
                warn!(account = %account, ?timeout, "Snapshot load timed out");
                LoadOutcome::Unavailable(format!("timed out after {timeout:?}"))
            }
        }
    }

    /// Records pending or in flight across all partitions.
    #[must_use]
    pub fn unflushed_count(&self) -> usize {
        self.inner
            .partitions
            .iter()
            .map(|p| p.value().state.lock().unflushed())
            .sum()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let c = &self.inner.counters;
        let (mut pending, mut in_flight) = (0u64, 0u64);
        for p in self.inner.partitions.iter() {
            let st = p.value().state.lock();
            pending += st.pending.len() as u64;
            in_flight += u64::from(st.in_flight.is_some());
        }
        QueueStats {
            pending,
            in_flight,
            enqueued: c.enqueued.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            audit_failures: c.audit_failures.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn partition_status(&self, account: &AccountId) -> Option<PartitionStatus> {
        let p = self.inner.partitions.get(account)?;
        let st = p.value().state.lock();
        Some(PartitionStatus {
            account: account.clone(),
            pending: st.pending.len(),
            in_flight: st.in_flight,
            highest_committed: st.highest_committed,
            last_terminal: st.last_terminal,
            last_error: st.last_error.clone(),
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until nothing is pending or in flight, up to `timeout`.
    ///
    /// Returns true if the queue went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.unflushed_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop accepting records, drain until `deadline`, then abort workers.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Persistence queue already closed");
        }
        info!(unflushed = self.unflushed_count(), ?deadline, "Draining persistence queue");

        for p in self.inner.partitions.iter() {
            p.value().notify.notify_one();
        }

        let mut handles = std::mem::take(&mut *self.inner.workers.lock());
        let drained = tokio::time::timeout(deadline, async {
            for h in handles.iter_mut() {
                if let Err(e) = h.await {
                    warn!(?e, "Partition worker ended abnormally");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            self.inner.cancel.cancel();
            for h in &handles {
                h.abort();
            }
            // Let cancelled workers observe the token before counting.
            tokio::task::yield_now().await;
        }

        let unflushed = self.unflushed_count();
        if unflushed > 0 {
            warn!(unflushed, drained, "Persistence queue shut down with unflushed records");
        } else {
            info!("Persistence queue drained");
        }
        if let Some(audit) = &self.inner.audit {
            audit.close();
        }
        ShutdownReport { unflushed, drained }
    }
}

impl SnapshotSink for PersistenceQueue {
    fn enqueue(&self, record: PersistenceRecord) -> EnqueueResult {
        PersistenceQueue::enqueue(self, record)
    }
}

impl std::fmt::Debug for PersistenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceQueue")
            .field("store", &self.inner.store.name())
            .field("partitions", &self.inner.partitions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_partition(inner: Arc<QueueInner>, partition: Arc<Partition>) {
    debug!(account = %partition.account, "Partition worker running");
    loop {
        if let Some((newest, older)) = partition.drain() {
            supersede(&inner, &partition, older, false).await;
            if !commit(&inner, &partition, newest).await {
                break;
            }
            continue;
        }
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = partition.notify.notified() => {}
            _ = inner.cancel.cancelled() => break,
        }
    }
    debug!(account = %partition.account, "Partition worker stopped");
}

/// Count `older` as superseded and append them to the audit stream.
///
/// `in_flight` is true when one of them was the in-flight record.
async fn supersede(
    inner: &QueueInner,
    partition: &Partition,
    older: Vec<PersistenceRecord>,
    in_flight: bool,
) {
    if older.is_empty() {
        return;
    }
    let n = older.len() as u64;
    bump(&inner.counters.superseded, n);
    Metrics::persist_superseded(n);
    Metrics::persist_backlog_add(-(n as i64));
    trace!(account = %partition.account, count = n, in_flight, "Snapshots superseded");

    let entries = older.into_iter().map(|r| AuditEntry::new(r, true)).collect();
    audit(inner, partition, entries).await;
}

async fn audit(inner: &QueueInner, partition: &Partition, entries: Vec<AuditEntry>) {
    let Some(log) = &inner.audit else {
        return;
    };
    if let Err(e) = log.append_blocking(entries).await {
        bump(&inner.counters.audit_failures, 1);
        Metrics::audit_failed(partition.account.as_str());
        warn!(account = %partition.account, error = %e, "Audit append failed");
    }
}

/// Commit `record`, retrying and superseding as needed.
///
/// Returns false if the worker was cancelled.
async fn commit(inner: &QueueInner, partition: &Partition, mut record: PersistenceRecord) -> bool {
    audit(inner, partition, vec![AuditEntry::new(record.clone(), false)]).await;

    let policy = &inner.config.retry;
    let store = &inner.store;
    let account = &partition.account;

    loop {
        if partition.state.lock().is_stale(record.sequence) {
            bump(&inner.counters.stale, 1);
            Metrics::persist_stale(1);
            Metrics::persist_backlog_add(-1);
            debug!(account = %account, seq = record.sequence, "Stale snapshot dropped before commit");
            partition.state.lock().in_flight = None;
            return true;
        }

        record.attempts += 1;
        record.status = RecordStatus::InFlight;
        let started = Instant::now();

        let outcome = tokio::select! {
            r = store.upsert_snapshot(record.clone()) => r,
            _ = inner.cancel.cancelled() => {
                warn!(account = %account, seq = record.sequence, "Commit aborted by shutdown");
                return false;
            }
        };

        match outcome {
            Ok(UpsertOutcome::Superseded { stored }) => {
                let reason = format!("store holds sequence {stored}, ahead of {}", record.sequence);
                {
                    let mut st = partition.state.lock();
                    st.finish(record.sequence, RecordStatus::Failed);
                    st.last_error = Some(reason.clone());
                }
                bump(&inner.counters.failed, 1);
                Metrics::persist_failed();
                Metrics::persist_backlog_add(-1);
                error!(
                    account = %account,
                    seq = record.sequence,
                    stored,
                    "Snapshot not written: {reason}"
                );
                return true;
            }
            Ok(UpsertOutcome::Written) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                partition.state.lock().finish(record.sequence, RecordStatus::Committed);
                bump(&inner.counters.committed, 1);
                Metrics::persist_committed(store.name(), latency_ms);
                Metrics::persist_backlog_add(-1);
                debug!(
                    account = %account,
                    seq = record.sequence,
                    attempts = record.attempts,
                    latency_ms,
                    "Snapshot committed"
                );
                return true;
            }
            Err(e) if e.is_retryable() && policy.has_remaining(record.attempts) => {
                bump(&inner.counters.retries, 1);
                Metrics::persist_retry(account.as_str());
                let delay = policy.delay(record.attempts);
                warn!(
                    account = %account,
                    seq = record.sequence,
                    attempt = record.attempts,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    error = %e,
                    "Snapshot commit failed, retrying"
                );
                partition.state.lock().last_error = Some(e.to_string());

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.cancel.cancelled() => return false,
                }

                if let Some((newest, mut older)) = partition.drain() {
                    debug!(
                        account = %account,
                        seq = record.sequence,
                        newer = newest.sequence,
                        "Newer snapshot arrived during retry"
                    );
                    older.insert(0, record);
                    supersede(inner, partition, older, true).await;
                    record = newest;
                    audit(inner, partition, vec![AuditEntry::new(record.clone(), false)]).await;
                }
            }
            Err(e) => {
                {
                    let mut st = partition.state.lock();
                    st.finish(record.sequence, RecordStatus::Failed);
                    st.last_error = Some(e.to_string());
                }
                bump(&inner.counters.failed, 1);
                Metrics::persist_failed();
                Metrics::persist_backlog_add(-1);
                error!(
                    account = %account,
                    seq = record.sequence,
                    attempts = record.attempts,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Snapshot persistence failed"
                );
                return true;
            }
        }
    }
}
