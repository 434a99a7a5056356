//! Snapshot stores: pending/finalized records plus a crash-recovery journal.
//!
//! Layout of the filesystem store, one directory per frame:
//!
//! ```text
//! <root>/<frame_id>/<snapshot_id>.json           finalized
//! <root>/<frame_id>/<snapshot_id>.json.pending   not yet committed
//! <root>/<frame_id>/journal.jsonl                one entry per commit intent
//! ```
//!
//! Finalize is an atomic rename. Recovery finalizes journaled snapshots left
//! pending (the CAS happened, the rename did not) and deletes orphan pending
//! files older than the GC age.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ContextSnapshot, FrameError};

/// Commit-intent record written between the pending write and the CAS.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub frame_id: String,
    pub snapshot_id: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// What recovery did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecoveryReport {
    /// `(frame_id, snapshot_id)` pairs finalized from the journal.
    pub finalized: Vec<(String, String)>,
    /// Orphan pending snapshots deleted by age.
    pub deleted_pending: Vec<(String, String)>,
}

/// Persistence for snapshots and the commit journal.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_pending(&self, snapshot: &ContextSnapshot) -> Result<(), FrameError>;

    /// Atomically promotes a pending snapshot to finalized.
    async fn finalize(&self, frame_id: &str, snapshot_id: &str) -> Result<(), FrameError>;

    /// Loads a finalized snapshot.
    async fn load(&self, frame_id: &str, snapshot_id: &str) -> Result<ContextSnapshot, FrameError>;

    async fn delete(&self, frame_id: &str, snapshot_id: &str) -> Result<(), FrameError>;

    async fn append_journal(&self, entry: &JournalEntry) -> Result<(), FrameError>;

    /// Crash recovery: finalize journaled pendings, GC orphans by age.
    async fn recover(&self, pending_max_age: Duration) -> Result<RecoveryReport, FrameError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct MemRecord {
    snapshot: ContextSnapshot,
    finalized: bool,
    saved_at: DateTime<Utc>,
}

/// Volatile store for tests and frames that do not need durability.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    records: Mutex<HashMap<(String, String), MemRecord>>,
    journal: Mutex<Vec<JournalEntry>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save_pending(&self, snapshot: &ContextSnapshot) -> Result<(), FrameError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(
            (snapshot.frame_id.clone(), snapshot.snapshot_id.clone()),
            MemRecord {
                snapshot: snapshot.clone(),
                finalized: false,
                saved_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn finalize(&self, frame_id: &str, snapshot_id: &str) -> Result<(), FrameError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(&(frame_id.to_string(), snapshot_id.to_string()))
            .ok_or_else(|| FrameError::SnapshotNotFound {
                frame_id: frame_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            })?;
        record.finalized = true;
        Ok(())
    }

    async fn load(&self, frame_id: &str, snapshot_id: &str) -> Result<ContextSnapshot, FrameError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(&(frame_id.to_string(), snapshot_id.to_string()))
            .filter(|r| r.finalized)
            .map(|r| r.snapshot.clone())
            .ok_or_else(|| FrameError::SnapshotNotFound {
                frame_id: frame_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            })
    }

    async fn delete(&self, frame_id: &str, snapshot_id: &str) -> Result<(), FrameError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(&(frame_id.to_string(), snapshot_id.to_string()));
        Ok(())
    }

    async fn append_journal(&self, entry: &JournalEntry) -> Result<(), FrameError> {
        let mut journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
        journal.push(entry.clone());
        Ok(())
    }

    async fn recover(&self, pending_max_age: Duration) -> Result<RecoveryReport, FrameError> {
        let journal: Vec<JournalEntry> = {
            let j = self.journal.lock().unwrap_or_else(|e| e.into_inner());
            j.clone()
        };
        let mut report = RecoveryReport::default();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        for entry in &journal {
            let key = (entry.frame_id.clone(), entry.snapshot_id.clone());
            if let Some(record) = records.get_mut(&key) {
                if !record.finalized {
                    record.finalized = true;
                    report.finalized.push(key);
                }
            }
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(pending_max_age)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let stale: Vec<(String, String)> = records
            .iter()
            .filter(|(_, r)| !r.finalized && r.saved_at < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            records.remove(&key);
            report.deleted_pending.push(key);
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// Durable store: one directory per frame, JSON records, atomic rename.
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn frame_dir(&self, frame_id: &str) -> PathBuf {
        self.root.join(frame_id)
    }

    fn pending_path(&self, frame_id: &str, snapshot_id: &str) -> PathBuf {
        self.frame_dir(frame_id)
            .join(format!("{snapshot_id}.json.pending"))
    }

    fn final_path(&self, frame_id: &str, snapshot_id: &str) -> PathBuf {
        self.frame_dir(frame_id).join(format!("{snapshot_id}.json"))
    }

    fn journal_path(&self, frame_id: &str) -> PathBuf {
        self.frame_dir(frame_id).join("journal.jsonl")
    }
}

fn io_err(e: std::io::Error) -> FrameError {
    FrameError::Store(e.to_string())
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn save_pending(&self, snapshot: &ContextSnapshot) -> Result<(), FrameError> {
        let dir = self.frame_dir(&snapshot.frame_id);
        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;
        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| FrameError::Serialization(e.to_string()))?;
        tokio::fs::write(
            self.pending_path(&snapshot.frame_id, &snapshot.snapshot_id),
            body,
        )
        .await
        .map_err(io_err)
    }

    async fn finalize(&self, frame_id: &str, snapshot_id: &str) -> Result<(), FrameError> {
        let pending = self.pending_path(frame_id, snapshot_id);
        if !pending.exists() {
            return Err(FrameError::SnapshotNotFound {
                frame_id: frame_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            });
        }
        tokio::fs::rename(pending, self.final_path(frame_id, snapshot_id))
            .await
            .map_err(io_err)
    }

    async fn load(&self, frame_id: &str, snapshot_id: &str) -> Result<ContextSnapshot, FrameError> {
        let body = tokio::fs::read(self.final_path(frame_id, snapshot_id))
            .await
            .map_err(|_| FrameError::SnapshotNotFound {
                frame_id: frame_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            })?;
        serde_json::from_slice(&body).map_err(|e| FrameError::Serialization(e.to_string()))
    }

    async fn delete(&self, frame_id: &str, snapshot_id: &str) -> Result<(), FrameError> {
        let _ = tokio::fs::remove_file(self.final_path(frame_id, snapshot_id)).await;
        let _ = tokio::fs::remove_file(self.pending_path(frame_id, snapshot_id)).await;
        Ok(())
    }

    async fn append_journal(&self, entry: &JournalEntry) -> Result<(), FrameError> {
        let dir = self.frame_dir(&entry.frame_id);
        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;
        let mut line = serde_json::to_string(entry)
            .map_err(|e| FrameError::Serialization(e.to_string()))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(&entry.frame_id))
            .await
            .map_err(io_err)?;
        use tokio::io::AsyncWriteExt;
        file.write_all(line.as_bytes()).await.map_err(io_err)
    }

    async fn recover(&self, pending_max_age: Duration) -> Result<RecoveryReport, FrameError> {
        let mut report = RecoveryReport::default();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(_) => return Ok(report),
        };
        while let Some(frame_entry) = dirs.next_entry().await.map_err(io_err)? {
            if !frame_entry.path().is_dir() {
                continue;
            }
            let frame_id = frame_entry.file_name().to_string_lossy().into_owned();

            // Journaled pendings: the CAS succeeded, the rename did not.
            let journal = tokio::fs::read_to_string(self.journal_path(&frame_id))
                .await
                .unwrap_or_default();
            for line in journal.lines() {
                let Ok(entry) = serde_json::from_str::<JournalEntry>(line) else {
                    warn!(frame_id = %frame_id, "skipping corrupt journal line");
                    continue;
                };
                let pending = self.pending_path(&frame_id, &entry.snapshot_id);
                if pending.exists() {
                    debug!(frame_id = %frame_id, snapshot_id = %entry.snapshot_id, "recovering journaled snapshot");
                    tokio::fs::rename(pending, self.final_path(&frame_id, &entry.snapshot_id))
                        .await
                        .map_err(io_err)?;
                    report.finalized.push((frame_id.clone(), entry.snapshot_id));
                }
            }

            // Orphan pendings past the GC age.
            let mut files = tokio::fs::read_dir(frame_entry.path()).await.map_err(io_err)?;
            while let Some(file) = files.next_entry().await.map_err(io_err)? {
                let name = file.file_name().to_string_lossy().into_owned();
                let Some(stem) = name.strip_suffix(".json.pending") else {
                    continue;
                };
                let age = file
                    .metadata()
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.elapsed().ok())
                    .unwrap_or_default();
                if age > pending_max_age {
                    let _ = tokio::fs::remove_file(file.path()).await;
                    report
                        .deleted_pending
                        .push((frame_id.clone(), stem.to_string()));
                }
            }
        }
        Ok(report)
    }
}
