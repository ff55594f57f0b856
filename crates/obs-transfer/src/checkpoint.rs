//! Checkpoint persistence
//!
//! A checkpoint records which parts of a transfer already reached their
//! destination so a later run can skip them. Records are JSON files written
//! with write-to-temp-then-rename so a crash mid-write never leaves a
//! truncated checkpoint behind.

use crate::plan::TransferPlan;
use crate::types::CompletedPart;
use crate::{Result, TransferError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Current on-disk format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// What is being transferred, as observed when the transfer started
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceIdentity {
    /// Local file being uploaded
    LocalFile {
        path: PathBuf,
        size: u64,
        modified: Option<DateTime<Utc>>,
    },
    /// Seekable stream being uploaded
    Stream { size: u64 },
    /// Remote object being downloaded into `destination`
    RemoteObject {
        size: u64,
        etag: String,
        version_id: Option<String>,
        destination: PathBuf,
    },
}

/// Identifies the (source, destination) pair a checkpoint belongs to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub bucket: String,
    pub key: String,
    pub source: SourceIdentity,
}

/// Durable progress of one transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub fingerprint: SourceFingerprint,
    pub plan_hash: String,
    pub total_size: u64,
    pub part_size: u64,
    /// Multipart session, uploads only
    pub upload_id: Option<String>,
    pub completed_parts: BTreeMap<u32, CompletedPart>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Fresh record with no completed parts
    pub fn new(fingerprint: SourceFingerprint, plan: &TransferPlan, upload_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            fingerprint,
            plan_hash: plan.plan_hash(),
            total_size: plan.total_size(),
            part_size: plan.part_size(),
            upload_id,
            completed_parts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check that this record can resume the transfer described by
    /// `fingerprint` and `plan`.
    pub fn validate(&self, path: &Path, fingerprint: &SourceFingerprint, plan: &TransferPlan) -> Result<()> {
        let stale = |reason: String| TransferError::StaleCheckpoint {
            path: path.to_path_buf(),
            reason,
        };

        if self.version != CHECKPOINT_VERSION {
            return Err(stale(format!(
                "unsupported version {} (expected {})",
                self.version, CHECKPOINT_VERSION
            )));
        }
        if &self.fingerprint != fingerprint {
            return Err(stale("source or destination changed since the checkpoint was written".to_string()));
        }
        if self.plan_hash != plan.plan_hash() {
            return Err(stale("part plan does not match".to_string()));
        }
        for part in self.completed_parts.values() {
            match plan.part(part.part_number) {
                Some(planned) if planned.length == part.length => {}
                _ => {
                    return Err(stale(format!(
                        "completed part {} is not in the plan",
                        part.part_number
                    )))
                }
            }
        }
        Ok(())
    }

    /// Record a completed part, replacing any earlier entry for the same number
    pub fn insert_part(&mut self, part: CompletedPart) {
        self.completed_parts.insert(part.part_number, part);
        self.updated_at = Utc::now();
    }

    /// Completed part numbers
    pub fn completed_numbers(&self) -> BTreeSet<u32> {
        self.completed_parts.keys().copied().collect()
    }

    /// Bytes already transferred according to this record
    pub fn completed_bytes(&self) -> u64 {
        self.completed_parts.values().map(|p| p.length).sum()
    }

    /// Completed parts ascending by part number
    pub fn sorted_parts(&self) -> Vec<CompletedPart> {
        self.completed_parts.values().cloned().collect()
    }
}

/// Location of a checkpoint file
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store backed by the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, `None` if no checkpoint exists
    pub async fn load(&self) -> Result<Option<CheckpointRecord>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| TransferError::CorruptCheckpoint {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Atomically replace the checkpoint with `record`
    pub async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            parts = record.completed_parts.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Remove the checkpoint; a missing file is not an error
    pub async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the advisory lock guarding this checkpoint against a second
    /// process. The lock file lives next to the checkpoint and is removed
    /// when the guard drops.
    pub fn lock(&self) -> Result<CheckpointLock> {
        let lock_path = with_suffix(&self.path, ".lock");
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                use std::io::Write;
                writeln!(file, "{}", std::process::id())?;
                Ok(CheckpointLock { path: lock_path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(TransferError::CheckpointLocked(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }
}

/// Held advisory lock on a checkpoint
#[derive(Debug)]
pub struct CheckpointLock {
    path: PathBuf,
}

impl Drop for CheckpointLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release checkpoint lock");
        }
    }
}

/// In-memory checkpoint shared by concurrent part completions.
///
/// Appends go through a mutex; flushes to disk go through a single async
/// flush lock so two writers never interleave. Without a store the journal
/// still collects completed parts for the combine step.
pub struct CheckpointJournal {
    store: Option<CheckpointStore>,
    record: parking_lot::Mutex<CheckpointRecord>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl CheckpointJournal {
    /// Journal over `record`, persisted to `store` when present
    pub fn new(store: Option<CheckpointStore>, record: CheckpointRecord) -> Self {
        Self {
            store,
            record: parking_lot::Mutex::new(record),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether progress is persisted
    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    /// Multipart session recorded in the checkpoint
    pub fn upload_id(&self) -> Option<String> {
        self.record.lock().upload_id.clone()
    }

    /// Completed part numbers
    pub fn completed_numbers(&self) -> BTreeSet<u32> {
        self.record.lock().completed_numbers()
    }

    /// Bytes covered by completed parts
    pub fn completed_bytes(&self) -> u64 {
        self.record.lock().completed_bytes()
    }

    /// Completed parts ascending by part number
    pub fn sorted_parts(&self) -> Vec<CompletedPart> {
        self.record.lock().sorted_parts()
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> CheckpointRecord {
        self.record.lock().clone()
    }

    /// Append a completed part and flush
    pub async fn record_part(&self, part: CompletedPart) -> Result<()> {
        self.record.lock().insert_part(part);
        self.flush().await
    }

    /// Write the current record to disk
    pub async fn flush(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock().await;
        let snapshot = self.snapshot();
        store.save(&snapshot).await
    }

    /// Delete the persisted checkpoint after a successful transfer
    pub async fn discard(&self) -> Result<()> {
        match &self.store {
            Some(store) => {
                let _guard = self.flush_lock.lock().await;
                store.delete().await
            }
            None => Ok(()),
        }
    }
}

/// Append `suffix` to the file name of `path`
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fingerprint(size: u64) -> SourceFingerprint {
        SourceFingerprint {
            bucket: "bucket".to_string(),
            key: "big.bin".to_string(),
            source: SourceIdentity::LocalFile {
                path: PathBuf::from("/data/big.bin"),
                size,
                modified: None,
            },
        }
    }

    fn part(n: u32, length: u64) -> CompletedPart {
        CompletedPart {
            part_number: n,
            etag: format!("etag-{}", n),
            length,
        }
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("big.bin.upload_record"));
        assert!(store.load().await.unwrap().is_none());

        let plan = TransferPlan::new(50, 10).unwrap();
        let mut record = CheckpointRecord::new(fingerprint(50), &plan, Some("upload-1".into()));
        record.insert_part(part(2, 10));
        store.save(&record).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(!dir.path().join("big.bin.upload_record.tmp").exists());

        store.delete().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("record");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = CheckpointStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, TransferError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_validate_detects_changed_source() {
        let plan = TransferPlan::new(50, 10).unwrap();
        let record = CheckpointRecord::new(fingerprint(50), &plan, Some("u".into()));
        let path = Path::new("record");

        record.validate(path, &fingerprint(50), &plan).unwrap();

        let grown = TransferPlan::new(60, 10).unwrap();
        let err = record.validate(path, &fingerprint(60), &grown).unwrap_err();
        assert!(matches!(err, TransferError::StaleCheckpoint { .. }));

        let err = record.validate(path, &fingerprint(50), &TransferPlan::new(50, 5).unwrap()).unwrap_err();
        assert!(matches!(err, TransferError::StaleCheckpoint { .. }));
    }

    #[test]
    fn test_validate_rejects_parts_outside_plan() {
        let plan = TransferPlan::new(50, 10).unwrap();
        let mut record = CheckpointRecord::new(fingerprint(50), &plan, None);
        record.insert_part(part(9, 10));
        let err = record
            .validate(Path::new("record"), &fingerprint(50), &plan)
            .unwrap_err();
        assert!(err.to_string().contains("part 9"));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("record"));

        let guard = store.lock().unwrap();
        assert!(matches!(store.lock(), Err(TransferError::CheckpointLocked(_))));
        drop(guard);
        assert!(store.lock().is_ok());
    }

    #[tokio::test]
    async fn test_journal_concurrent_appends() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("record"));
        let plan = TransferPlan::new(1000, 10).unwrap();
        let record = CheckpointRecord::new(fingerprint(1000), &plan, Some("u".into()));
        let journal = Arc::new(CheckpointJournal::new(Some(store.clone()), record));

        let mut handles = Vec::new();
        for n in 1..=100u32 {
            let journal = Arc::clone(&journal);
            handles.push(tokio::spawn(async move {
                journal.record_part(part(n, 10)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.completed_parts.len(), 100);
        assert_eq!(loaded.completed_bytes(), 1000);

        journal.discard().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
