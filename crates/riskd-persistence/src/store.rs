//! Durable snapshot stores.
//!
//! A `SnapshotStore` keeps the latest committed record per account:
//! - `upsert_snapshot` is idempotent by `(account, sequence)` and never
//!   replaces a record with a higher sequence; an ignored write is reported
//!   as `UpsertOutcome::Superseded`, never as a successful write
//! - `load_latest` returns the record with the highest committed sequence
//!
//! `MemorySnapshotStore` backs tests and the `memory` backend;
//! `FileSnapshotStore` writes one JSON document per account.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use riskd_core::{AccountId, PersistenceRecord, RecordStatus};

use crate::error::StoreError;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub type StoreResult<T> = Result<T, StoreError>;

/// What an upsert did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The record is now the stored one (or already was, byte for byte).
    Written,
    /// The store holds a newer record, or a different one under the same
    /// sequence. Nothing was written.
    Superseded { stored: u64 },
}

/// Decide whether `record` may replace `existing`.
fn supersedes(existing: &PersistenceRecord, record: &PersistenceRecord) -> Option<UpsertOutcome> {
    if existing.sequence > record.sequence
        || (existing.sequence == record.sequence && existing.snapshot != record.snapshot)
    {
        return Some(UpsertOutcome::Superseded {
            stored: existing.sequence,
        });
    }
    if existing.sequence == record.sequence {
        return Some(UpsertOutcome::Written);
    }
    None
}

/// Durable mirror of per-account risk snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Short label for logs and metrics.
    fn name(&self) -> &'static str;

    /// Write `record` unless a record with a higher sequence is already stored.
    fn upsert_snapshot(
        &self,
        record: PersistenceRecord,
    ) -> BoxFuture<'_, StoreResult<UpsertOutcome>>;

    /// Latest committed record for `account`, if any.
    fn load_latest<'a>(
        &'a self,
        account: &'a AccountId,
    ) -> BoxFuture<'a, StoreResult<Option<PersistenceRecord>>>;
}

/// Arc wrapper for SnapshotStore trait objects.
pub type DynSnapshotStore = Arc<dyn SnapshotStore>;

// ============================================================================
// MemorySnapshotStore
// ============================================================================

/// In-memory store with failure injection.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    records: Mutex<HashMap<AccountId, PersistenceRecord>>,
    /// `(account, sequence)` of every accepted upsert, in order.
    upserts: Mutex<Vec<(AccountId, u64)>>,
    /// Errors returned by the next upsert calls, front first.
    scripted: Mutex<VecDeque<StoreError>>,
    /// Accounts whose upserts always fail with the given error.
    broken_accounts: Mutex<HashMap<AccountId, StoreError>>,
    /// Every call fails transiently while set.
    unavailable: AtomicBool,
    /// Added to every call.
    latency: Mutex<Duration>,
    upsert_calls: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` upsert calls with `error`.
    pub fn fail_next(&self, n: usize, error: StoreError) {
        let mut scripted = self.scripted.lock();
        for _ in 0..n {
            scripted.push_back(error.clone());
        }
    }

    /// Fail every upsert for `account` with `error`.
    pub fn fail_account(&self, account: AccountId, error: StoreError) {
        self.broken_accounts.lock().insert(account, error);
    }

    /// Make every call fail transiently (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Seed a committed record, bypassing failure injection.
    pub fn insert(&self, record: PersistenceRecord) {
        self.records
            .lock()
            .insert(record.account.clone(), record.with_status(RecordStatus::Committed));
    }

    /// Currently stored record for `account`.
    #[must_use]
    pub fn committed(&self, account: &AccountId) -> Option<PersistenceRecord> {
        self.records.lock().get(account).cloned()
    }

    /// Accepted upserts in commit order.
    #[must_use]
    pub fn upserts(&self) -> Vec<(AccountId, u64)> {
        self.upserts.lock().clone()
    }

    /// Upsert calls made, successful or not.
    #[must_use]
    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn injected_failure(&self, account: &AccountId) -> Option<StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Some(StoreError::Transient("store unavailable".to_string()));
        }
        if let Some(e) = self.scripted.lock().pop_front() {
            return Some(e);
        }
        self.broken_accounts.lock().get(account).cloned()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn upsert_snapshot(
        &self,
        record: PersistenceRecord,
    ) -> BoxFuture<'_, StoreResult<UpsertOutcome>> {
        Box::pin(async move {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate_latency().await;
            if let Some(e) = self.injected_failure(&record.account) {
                return Err(e);
            }
            if !record.is_well_formed() {
                return Err(StoreError::Permanent(format!(
                    "record key ({}, {}) does not match snapshot",
                    record.account, record.sequence
                )));
            }

            let mut records = self.records.lock();
            if let Some(outcome) = records
                .get(&record.account)
                .and_then(|existing| supersedes(existing, &record))
            {
                debug!(
                    account = %record.account,
                    seq = record.sequence,
                    ?outcome,
                    "Upsert not applied"
                );
                return Ok(outcome);
            }
            self.upserts
                .lock()
                .push((record.account.clone(), record.sequence));
            records.insert(
                record.account.clone(),
                record.with_status(RecordStatus::Committed),
            );
            Ok(UpsertOutcome::Written)
        })
    }

    fn load_latest<'a>(
        &'a self,
        account: &'a AccountId,
    ) -> BoxFuture<'a, StoreResult<Option<PersistenceRecord>>> {
        Box::pin(async move {
            self.simulate_latency().await;
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(StoreError::Transient("store unavailable".to_string()));
            }
            Ok(self.records.lock().get(account).cloned())
        })
    }
}

// ============================================================================
// FileSnapshotStore
// ============================================================================

/// One JSON document per account under `dir`.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// leaves either the old or the new snapshot, never a torn one.
#[derive(Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    /// Serializes the read-compare-write of an upsert.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSnapshotStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "Opened file snapshot store");
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, account: &AccountId) -> PathBuf {
        self.dir.join(format!("{}.json", account.file_stem()))
    }

    async fn read(path: &Path, account: &AccountId) -> StoreResult<Option<PersistenceRecord>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: PersistenceRecord = serde_json::from_slice(&bytes)?;
        if &record.account != account {
            // Two ids mapped to the same file stem.
            warn!(
                requested = %account,
                stored = %record.account,
                path = %path.display(),
                "Snapshot file belongs to a different account"
            );
            return Err(StoreError::Permanent(format!(
                "file {} holds account {}",
                path.display(),
                record.account
            )));
        }
        Ok(Some(record))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn upsert_snapshot(
        &self,
        record: PersistenceRecord,
    ) -> BoxFuture<'_, StoreResult<UpsertOutcome>> {
        Box::pin(async move {
            if !record.is_well_formed() {
                return Err(StoreError::Permanent(format!(
                    "record key ({}, {}) does not match snapshot",
                    record.account, record.sequence
                )));
            }
            let _guard = self.write_lock.lock().await;

            let path = self.path_for(&record.account);
            if let Some(existing) = Self::read(&path, &record.account).await? {
                if let Some(outcome) = supersedes(&existing, &record) {
                    return Ok(outcome);
                }
            }

            let committed = record.with_status(RecordStatus::Committed);
            let json = serde_json::to_vec_pretty(&committed)?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, &path).await?;

            debug!(
                account = %record.account,
                seq = record.sequence,
                path = %path.display(),
                "Snapshot written"
            );
            Ok(UpsertOutcome::Written)
        })
    }

    fn load_latest<'a>(
        &'a self,
        account: &'a AccountId,
    ) -> BoxFuture<'a, StoreResult<Option<PersistenceRecord>>> {
        Box::pin(async move { Self::read(&self.path_for(account), account).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use riskd_core::{Money, RiskSnapshot, SnapshotCause};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn record(account: &str, seq: u64) -> PersistenceRecord {
        let mut snap =
            RiskSnapshot::fresh(AccountId::new(account), Money::new(dec!(1000)), Utc::now());
        snap.sequence = seq;
        snap.daily_pnl = Money::new(rust_decimal::Decimal::from(seq));
        PersistenceRecord::pending(snap, SnapshotCause::Mutation)
    }

    #[tokio::test]
    async fn test_memory_never_overwrites_higher_sequence() {
        let store = MemorySnapshotStore::new();
        let first = record("a", 5);
        assert_eq!(
            store.upsert_snapshot(first.clone()).await.unwrap(),
            UpsertOutcome::Written
        );
        assert_eq!(
            store.upsert_snapshot(record("a", 3)).await.unwrap(),
            UpsertOutcome::Superseded { stored: 5 }
        );
        assert_eq!(
            store.upsert_snapshot(first).await.unwrap(),
            UpsertOutcome::Written
        );

        let latest = store.load_latest(&AccountId::new("a")).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 5);
        assert_eq!(latest.status, RecordStatus::Committed);
        assert_eq!(store.upserts(), vec![(AccountId::new("a"), 5)]);
    }

    #[tokio::test]
    async fn test_same_sequence_different_state_is_superseded() {
        let store = MemorySnapshotStore::new();
        store.upsert_snapshot(record("a", 2)).await.unwrap();

        let mut other = record("a", 2);
        other.snapshot.daily_pnl = Money::new(dec!(-900));
        assert_eq!(
            store.upsert_snapshot(other).await.unwrap(),
            UpsertOutcome::Superseded { stored: 2 }
        );
        let stored = store.committed(&AccountId::new("a")).unwrap();
        assert_eq!(stored.snapshot.daily_pnl, Money::new(dec!(2)));
    }

    #[tokio::test]
    async fn test_memory_scripted_failures() {
        let store = MemorySnapshotStore::new();
        store.fail_next(2, StoreError::Transient("blip".to_string()));

        assert!(store.upsert_snapshot(record("a", 1)).await.is_err());
        assert!(store.upsert_snapshot(record("a", 1)).await.is_err());
        assert!(store.upsert_snapshot(record("a", 1)).await.is_ok());
        assert_eq!(store.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn test_memory_rejects_malformed_record() {
        let store = MemorySnapshotStore::new();
        let mut bad = record("a", 4);
        bad.sequence = 9;
        let err = store.upsert_snapshot(bad).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_memory_unavailable_load() {
        let store = MemorySnapshotStore::new();
        store.set_unavailable(true);
        assert!(store.load_latest(&AccountId::new("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_ordering() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();
        let account = AccountId::new("acct/1");

        assert!(store.load_latest(&account).await.unwrap().is_none());

        store.upsert_snapshot(record("acct/1", 7)).await.unwrap();
        assert_eq!(
            store.upsert_snapshot(record("acct/1", 6)).await.unwrap(),
            UpsertOutcome::Superseded { stored: 7 }
        );

        let latest = store.load_latest(&account).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 7);
        assert_eq!(latest.snapshot.daily_pnl, Money::new(dec!(7)));
        assert!(dir.path().join("acct_1.json").exists());
        assert!(!dir.path().join("acct_1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileSnapshotStore::new(dir.path()).unwrap();
            store.upsert_snapshot(record("b", 3)).await.unwrap();
        }
        let store = FileSnapshotStore::new(dir.path()).unwrap();
        let latest = store.load_latest(&AccountId::new("b")).await.unwrap();
        assert_eq!(latest.map(|r| r.sequence), Some(3));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_permanent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("c.json"), b"{not json").unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();
        let err = store.load_latest(&AccountId::new("c")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
