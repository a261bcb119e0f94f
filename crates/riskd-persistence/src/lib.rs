//! Risk snapshot persistence for riskd.
//!
//! - `PersistenceQueue`: per-account partitions, one worker each, retry with
//!   capped backoff, stale-write rejection, coalescing under overflow
//! - `SnapshotStore`: durable mirror (`MemorySnapshotStore`, `FileSnapshotStore`)
//! - `AuditLog`: uncoalesced JSON Lines history of every drained snapshot
//!
//! Nothing in this crate is on the trading path except `enqueue`, which never
//! waits for storage.

pub mod audit;
pub mod error;
pub mod queue;
pub mod retry;
pub mod store;

pub use audit::{AuditEntry, AuditLog};
pub use error::{PersistenceError, PersistenceResult, StoreError};
pub use queue::{
    LoadOutcome, PartitionStatus, PersistenceQueue, QueueConfig, QueueStats, ShutdownReport,
};
pub use retry::RetryPolicy;
pub use store::{
    BoxFuture, DynSnapshotStore, FileSnapshotStore, MemorySnapshotStore, SnapshotStore,
    StoreResult, UpsertOutcome,
};
