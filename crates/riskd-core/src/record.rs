//! Persistence records and the snapshot hand-off contract.
//!
//! The risk engine never talks to storage. It hands each resulting snapshot to
//! a `SnapshotSink`, whose `enqueue` must return without touching I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::types::{BreachKind, RiskSnapshot};

// ============================================================================
// Record Types
// ============================================================================

/// Lifecycle of a persistence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Waiting in a partition buffer.
    Pending,
    /// Being written by the partition worker.
    InFlight,
    /// Acknowledged by the durable store.
    Committed,
    /// Gave up (attempts exhausted or permanent error).
    Failed,
}

impl RecordStatus {
    /// Committed and Failed are terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }
}

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "kind", rename_all = "snake_case")]
pub enum SnapshotCause {
    /// Ordinary P&L update.
    Mutation,
    /// Update that raised a breach pause.
    Breach(BreachKind),
    /// Update that raised both breach kinds at once.
    BothBreaches,
    /// Operator cleared a pause.
    OperatorResume,
    /// New trading day.
    DayRollover,
    /// State installed at startup recovery.
    Recovery,
}

impl SnapshotCause {
    /// Cause for an update that raised `kinds`, if it raised any.
    #[must_use]
    pub fn for_breaches(kinds: &[BreachKind]) -> Option<Self> {
        match kinds {
            [] => None,
            [kind] => Some(Self::Breach(*kind)),
            _ => Some(Self::BothBreaches),
        }
    }
}

/// One snapshot on its way to durable storage.
///
/// Idempotent by `(account, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceRecord {
    pub account: AccountId,
    pub sequence: u64,
    pub snapshot: RiskSnapshot,
    pub status: RecordStatus,
    /// Commit attempts made so far.
    pub attempts: u32,
    pub cause: SnapshotCause,
    pub enqueued_at: DateTime<Utc>,
}

impl PersistenceRecord {
    /// New pending record for `snapshot`.
    #[must_use]
    pub fn pending(snapshot: RiskSnapshot, cause: SnapshotCause) -> Self {
        Self {
            account: snapshot.account.clone(),
            sequence: snapshot.sequence,
            snapshot,
            status: RecordStatus::Pending,
            attempts: 0,
            cause,
            enqueued_at: Utc::now(),
        }
    }

    /// Copy of this record in `status`.
    #[must_use]
    pub fn with_status(&self, status: RecordStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Key fields agree with the carried snapshot.
    ///
    /// A record that fails this check is malformed and cannot be retried
    /// into validity.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.account == self.snapshot.account && self.sequence == self.snapshot.sequence
    }
}

// ============================================================================
// Hand-off
// ============================================================================

/// Result of handing a record to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnqueueResult {
    /// Record buffered.
    Queued,
    /// Record buffered; older pending records for the account were dropped
    /// because the partition was full.
    Coalesced,
    /// Record is at or below the account's committed high-water mark.
    Stale,
    /// Sink is shut down.
    Closed,
}

impl EnqueueResult {
    /// Returns true if the record is now pending.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Queued | Self::Coalesced)
    }
}

/// Non-blocking destination for snapshots.
///
/// Implementations must return in bounded time regardless of storage health.
pub trait SnapshotSink: Send + Sync {
    fn enqueue(&self, record: PersistenceRecord) -> EnqueueResult;
}
