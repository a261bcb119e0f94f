//! Append-only audit stream of risk snapshots.
//!
//! Uses JSON Lines format (.jsonl), one file per UTC day:
//! - Each line is a complete JSON object
//! - Partial file corruption only affects individual lines
//! - Can be read even if a write was interrupted
//!
//! Unlike the snapshot store, nothing here is coalesced: every record the
//! queue takes off a partition buffer is appended, including ones superseded
//! by a newer snapshot before they could be committed.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use riskd_core::PersistenceRecord;

use crate::error::PersistenceResult;

/// One audit line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub recorded_at: DateTime<Utc>,
    /// A newer snapshot for the same account replaced this one before commit.
    pub superseded: bool,
    pub record: PersistenceRecord,
}

impl AuditEntry {
    #[must_use]
    pub fn new(record: PersistenceRecord, superseded: bool) -> Self {
        Self {
            recorded_at: Utc::now(),
            superseded,
            record,
        }
    }
}

/// Active writer state for the daily file.
struct ActiveWriter {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// JSON Lines audit writer.
///
/// Append mode only; existing files are never truncated.
pub struct AuditLog {
    base_dir: PathBuf,
    active_writer: Mutex<Option<ActiveWriter>>,
}

impl AuditLog {
    /// Create an audit log writing under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            active_writer: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn open_writer(&self, date: &str) -> PersistenceResult<ActiveWriter> {
        let filename = self.base_dir.join(format!("audit_{date}.jsonl"));
        info!(filename = %filename.display(), "Opening audit writer (append mode)");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)?;

        Ok(ActiveWriter {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        })
    }

    fn close_writer(active: &mut ActiveWriter) {
        if let Err(e) = active.writer.flush() {
            warn!(?e, "Failed to flush audit writer on close");
        }
        info!(
            date = %active.date,
            records = active.records_written,
            "Closed audit writer"
        );
    }

    /// Append `entries` and flush them to disk.
    pub fn append(&self, entries: &[AuditEntry]) -> PersistenceResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut slot = self.active_writer.lock();

        // Rotate on date change; a writer that failed mid-append is reopened.
        let mut active = match slot.take() {
            Some(active) if active.date == today => active,
            Some(mut stale) => {
                Self::close_writer(&mut stale);
                self.open_writer(&today)?
            }
            None => self.open_writer(&today)?,
        };

        for entry in entries {
            let json = serde_json::to_string(entry)?;
            writeln!(active.writer, "{json}")?;
        }
        active.writer.flush()?;
        active.records_written += entries.len();
        *slot = Some(active);

        debug!(date = %today, records = entries.len(), "Appended audit entries");
        Ok(())
    }

    /// Append on the blocking pool.
    pub async fn append_blocking(
        self: &Arc<Self>,
        entries: Vec<AuditEntry>,
    ) -> PersistenceResult<()> {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || log.append(&entries)).await?
    }

    /// Read every entry from every audit file, oldest file first.
    ///
    /// Unparseable lines are skipped with a warning.
    pub fn read_all(&self) -> PersistenceResult<Vec<AuditEntry>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.base_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("audit_") && n.ends_with(".jsonl"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        let mut out = Vec::new();
        for path in files {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                match serde_json::from_str::<AuditEntry>(&line) {
                    Ok(entry) => out.push(entry),
                    Err(e) => {
                        warn!(path = %path.display(), line = lineno + 1, ?e, "Skipping bad audit line")
                    }
                }
            }
        }
        Ok(out)
    }

    /// Flush and close the current file.
    pub fn close(&self) {
        if let Some(mut active) = self.active_writer.lock().take() {
            Self::close_writer(&mut active);
        }
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskd_core::{AccountId, Money, RiskSnapshot, SnapshotCause};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn entry(seq: u64, superseded: bool) -> AuditEntry {
        let mut snap = RiskSnapshot::fresh(AccountId::new("a"), Money::new(dec!(500)), Utc::now());
        snap.sequence = seq;
        AuditEntry::new(
            PersistenceRecord::pending(snap, SnapshotCause::Mutation),
            superseded,
        )
    }

    fn line_count(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| {
                BufReader::new(File::open(e.path()).unwrap())
                    .lines()
                    .count()
            })
            .sum()
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path()).unwrap();

        log.append(&[entry(1, true), entry(2, false)]).unwrap();
        log.append(&[entry(3, false)]).unwrap();

        let entries = log.read_all().unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.record.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(entries[0].superseded);
    }

    #[test]
    fn test_append_mode_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let log = AuditLog::new(dir.path()).unwrap();
            log.append(&[entry(1, false), entry(2, false)]).unwrap();
        }
        {
            let log = AuditLog::new(dir.path()).unwrap();
            log.append(&[entry(3, false)]).unwrap();
        }
        assert_eq!(line_count(dir.path()), 3);
    }

    #[test]
    fn test_empty_append_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path()).unwrap();
        log.append(&[]).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_bad_line_skipped() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path()).unwrap();
        log.append(&[entry(1, false)]).unwrap();
        log.close();

        let path = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{truncated").unwrap();

        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_blocking() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(AuditLog::new(dir.path()).unwrap());
        log.append_blocking(vec![entry(9, false)]).await.unwrap();
        assert_eq!(log.read_all().unwrap()[0].record.sequence, 9);
    }
}
