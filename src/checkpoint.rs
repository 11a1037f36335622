//! Crash-safe checkpoints for long streaming extractions.
//!
//! Each source owns `<staging_root>/<source>/`:
//!
//! ```text
//! checkpoint.json       last committed resume point
//! checkpoint.json.tmp   in-flight write (never read)
//! complete.json         present once the stream was consumed to its end
//! ```
//!
//! Saves write the temp file, `fsync` it, then rename it over
//! `checkpoint.json`, so a reader sees either the previous or the new
//! checkpoint and never a torn one. A checkpoint that fails to parse is
//! treated as absent.
//!
//! `last_offset` is the resume point: the offset of the next unread unit
//! (for line-delimited input, the number of lines consumed).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const SCHEMA_VERSION: u32 = 1;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const MARKER_FILE: &str = "complete.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_offset: u64,
    pub processed_count: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub schema_version: u32,
}

/// Written when a stream was consumed to its end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub final_offset: u64,
    pub processed_count: u64,
    pub completed_at: DateTime<Utc>,
    pub run_id: String,
}

/// How a streaming extraction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Upstream has nothing left.
    Exhausted,
    /// Stopped by a limit; more data exists.
    LimitReached,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint offset for {source_name} must increase: last {last}, attempted {attempted}")]
    OffsetRegressed {
        source_name: String,
        last: u64,
        attempted: u64,
    },
    #[error("checkpoint I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct CheckpointManager {
    staging_root: PathBuf,
    /// Last committed `(run_id, offset)` per source.
    committed: Mutex<HashMap<String, (String, u64)>>,
}

impl CheckpointManager {
    pub fn new(staging_root: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
            committed: Mutex::new(HashMap::new()),
        }
    }

    pub fn source_dir(&self, source: &str) -> PathBuf {
        self.staging_root.join(source)
    }

    pub fn checkpoint_path(&self, source: &str) -> PathBuf {
        self.source_dir(source).join(CHECKPOINT_FILE)
    }

    pub fn marker_path(&self, source: &str) -> PathBuf {
        self.source_dir(source).join(MARKER_FILE)
    }

    /// Atomically persist a new resume point.
    ///
    /// Within one `run_id` lineage offsets must strictly increase; a save
    /// that does not advance is rejected with
    /// [`CheckpointError::OffsetRegressed`] and leaves the file untouched.
    pub async fn save(
        &self,
        source: &str,
        last_offset: u64,
        processed_count: u64,
        run_id: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let mut committed = self.committed.lock().await;
        let previous = match committed.get(source) {
            Some(entry) => Some(entry.clone()),
            None => self
                .load(source)
                .await
                .map(|cp| (cp.run_id, cp.last_offset)),
        };
        if let Some((prev_run, prev_offset)) = previous {
            if prev_run == run_id && last_offset <= prev_offset {
                return Err(CheckpointError::OffsetRegressed {
                    source_name: source.to_string(),
                    last: prev_offset,
                    attempted: last_offset,
                });
            }
        }

        let checkpoint = Checkpoint {
            last_offset,
            processed_count,
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            schema_version: SCHEMA_VERSION,
        };
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        write_atomic(&self.checkpoint_path(source), &bytes).await?;

        committed.insert(source.to_string(), (run_id.to_string(), last_offset));
        debug!(source, last_offset, processed_count, "Checkpoint saved");
        Ok(checkpoint)
    }

    /// The committed checkpoint, or `None` when absent or unusable.
    pub async fn load(&self, source: &str) -> Option<Checkpoint> {
        let path = self.checkpoint_path(source);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(source, path = %path.display(), error = %e, "Unreadable checkpoint, starting from offset 0");
                return None;
            }
        };
        match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(cp) if cp.schema_version == SCHEMA_VERSION => Some(cp),
            Ok(cp) => {
                warn!(
                    source,
                    found = cp.schema_version,
                    expected = SCHEMA_VERSION,
                    "Checkpoint schema mismatch, starting from offset 0"
                );
                None
            }
            Err(e) => {
                warn!(source, path = %path.display(), error = %e, "Corrupt checkpoint, starting from offset 0");
                None
            }
        }
    }

    /// Remove the checkpoint. Missing files are not an error.
    pub async fn clear(&self, source: &str) -> Result<(), CheckpointError> {
        self.committed.lock().await.remove(source);
        remove_if_exists(&self.checkpoint_path(source)).await
    }

    /// Record how a stream ended.
    ///
    /// `Exhausted` clears the checkpoint and writes the completion marker;
    /// `LimitReached` keeps the checkpoint and removes any stale marker.
    pub async fn finish(
        &self,
        source: &str,
        end: StreamEnd,
        final_offset: u64,
        processed_count: u64,
        run_id: &str,
    ) -> Result<(), CheckpointError> {
        match end {
            StreamEnd::Exhausted => {
                let marker = CompletionMarker {
                    final_offset,
                    processed_count,
                    completed_at: Utc::now(),
                    run_id: run_id.to_string(),
                };
                let bytes = serde_json::to_vec_pretty(&marker)?;
                write_atomic(&self.marker_path(source), &bytes).await?;
                self.clear(source).await
            }
            StreamEnd::LimitReached => remove_if_exists(&self.marker_path(source)).await,
        }
    }

    pub async fn completion(&self, source: &str) -> Option<CompletionMarker> {
        let bytes = tokio::fs::read(self.marker_path(source)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn is_complete(&self, source: &str) -> bool {
        self.completion(source).await.is_some()
    }

    /// Remove the checkpoint and the completion marker.
    pub async fn reset(&self, source: &str) -> Result<(), CheckpointError> {
        self.clear(source).await?;
        remove_if_exists(&self.marker_path(source)).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

async fn remove_if_exists(path: &Path) -> Result<(), CheckpointError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Drives periodic saves for one pipeline run.
///
/// Counts consumed records and saves every `every` of them. Resuming from a
/// checkpoint continues its `run_id` lineage and cumulative count. A
/// [`hold`](Self::hold) caps the saved resume point for the rest of the run.
pub struct CheckpointTracker {
    manager: Arc<CheckpointManager>,
    source: String,
    run_id: String,
    every: u64,
    processed_count: u64,
    since_save: u64,
    last_offset: u64,
    saved_offset: u64,
    held: Option<u64>,
}

impl CheckpointTracker {
    /// `fresh_run_id` is used when there is nothing to resume.
    pub fn new(
        manager: Arc<CheckpointManager>,
        source: &str,
        every: u64,
        resume: Option<&Checkpoint>,
        start_offset: u64,
        fresh_run_id: &str,
    ) -> Self {
        let (run_id, processed_count, offset) = match resume {
            Some(cp) => (cp.run_id.clone(), cp.processed_count, cp.last_offset),
            None => (fresh_run_id.to_string(), 0, start_offset),
        };
        Self {
            manager,
            source: source.to_string(),
            run_id,
            every: every.max(1),
            processed_count,
            since_save: 0,
            last_offset: offset,
            saved_offset: offset,
            held: None,
        }
    }

    /// Mark one record consumed; `resume_offset` is where a restart would
    /// continue. Returns whether this call saved a checkpoint.
    pub async fn advance(&mut self, resume_offset: u64) -> Result<bool, CheckpointError> {
        self.processed_count += 1;
        self.since_save += 1;
        if resume_offset > self.last_offset {
            self.last_offset = resume_offset;
        }
        if self.since_save >= self.every {
            return self.flush().await;
        }
        Ok(false)
    }

    /// Move the resume point without counting a record (e.g. skipped
    /// malformed input).
    pub fn skip_to(&mut self, resume_offset: u64) {
        if resume_offset > self.last_offset {
            self.last_offset = resume_offset;
        }
    }

    /// Keep the persisted resume point at or before `offset`, so the unit
    /// starting there is read again by the next run.
    pub fn hold(&mut self, offset: u64) {
        self.held = Some(self.held.map_or(offset, |held| held.min(offset)));
    }

    /// Where a restart continues: the furthest consumed offset, capped by
    /// any hold.
    pub fn resume_offset(&self) -> u64 {
        match self.held {
            Some(held) => held.min(self.last_offset),
            None => self.last_offset,
        }
    }

    /// Save if the resume point moved since the last save.
    pub async fn flush(&mut self) -> Result<bool, CheckpointError> {
        self.since_save = 0;
        let resume = self.resume_offset();
        if resume <= self.saved_offset {
            return Ok(false);
        }
        self.manager
            .save(&self.source, resume, self.processed_count, &self.run_id)
            .await?;
        self.saved_offset = resume;
        Ok(true)
    }

    pub async fn finish(&mut self, end: StreamEnd) -> Result<(), CheckpointError> {
        if end == StreamEnd::LimitReached {
            self.flush().await?;
        }
        let final_offset = self.resume_offset();
        self.manager
            .finish(&self.source, end, final_offset, self.processed_count, &self.run_id)
            .await
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_then_load_returns_latest() {
        let tmp = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(tmp.path());
        for offset in [10, 20, 35] {
            mgr.save("wiki", offset, offset, "run-1").await.unwrap();
        }
        let cp = mgr.load("wiki").await.unwrap();
        assert_eq!(cp.last_offset, 35);
        assert_eq!(cp.run_id, "run-1");
        assert_eq!(cp.schema_version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_out_of_order_save_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(tmp.path());
        mgr.save("wiki", 50, 50, "run-1").await.unwrap();

        let err = mgr.save("wiki", 40, 40, "run-1").await.unwrap_err();
        assert!(matches!(err, CheckpointError::OffsetRegressed { last: 50, attempted: 40, .. }));
        let err = mgr.save("wiki", 50, 50, "run-1").await.unwrap_err();
        assert!(matches!(err, CheckpointError::OffsetRegressed { .. }));
        assert_eq!(mgr.load("wiki").await.unwrap().last_offset, 50);

        // A new lineage may start over.
        mgr.save("wiki", 5, 5, "run-2").await.unwrap();
        assert_eq!(mgr.load("wiki").await.unwrap().last_offset, 5);
    }

    #[tokio::test]
    async fn test_regression_checked_against_disk_after_restart() {
        let tmp = TempDir::new().unwrap();
        CheckpointManager::new(tmp.path())
            .save("wiki", 100, 100, "run-1")
            .await
            .unwrap();
        let fresh = CheckpointManager::new(tmp.path());
        assert!(fresh.save("wiki", 99, 99, "run-1").await.is_err());
    }

    #[tokio::test]
    async fn test_crash_before_rename_keeps_previous_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(tmp.path());
        mgr.save("wiki", 10, 10, "run-1").await.unwrap();

        // A torn temp file from an interrupted save.
        let tmp_path = tmp.path().join("wiki").join("checkpoint.json.tmp");
        std::fs::write(&tmp_path, b"{\"last_offset\": 99").unwrap();

        let cp = mgr.load("wiki").await.unwrap();
        assert_eq!(cp.last_offset, 10);

        // The next save overwrites the stale temp file.
        mgr.save("wiki", 20, 20, "run-1").await.unwrap();
        assert_eq!(mgr.load("wiki").await.unwrap().last_offset, 20);
    }

    #[tokio::test]
    async fn test_corrupt_or_missing_checkpoint_is_none() {
        let tmp = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(tmp.path());
        assert!(mgr.load("wiki").await.is_none());

        std::fs::create_dir_all(tmp.path().join("wiki")).unwrap();
        std::fs::write(mgr.checkpoint_path("wiki"), b"not json").unwrap();
        assert!(mgr.load("wiki").await.is_none());

        let old = serde_json::json!({
            "last_offset": 5, "processed_count": 5,
            "timestamp": "2026-01-01T00:00:00Z", "run_id": "r", "schema_version": 0
        });
        std::fs::write(mgr.checkpoint_path("wiki"), old.to_string()).unwrap();
        assert!(mgr.load("wiki").await.is_none());
    }

    #[tokio::test]
    async fn test_finish_distinguishes_exhausted_from_limit() {
        let tmp = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(tmp.path());

        mgr.save("crawl", 10, 10, "run-1").await.unwrap();
        mgr.finish("crawl", StreamEnd::LimitReached, 10, 10, "run-1")
            .await
            .unwrap();
        assert!(mgr.load("crawl").await.is_some());
        assert!(!mgr.is_complete("crawl").await);

        mgr.finish("crawl", StreamEnd::Exhausted, 12, 12, "run-1")
            .await
            .unwrap();
        assert!(mgr.load("crawl").await.is_none());
        let marker = mgr.completion("crawl").await.unwrap();
        assert_eq!(marker.final_offset, 12);

        // A later limited run drops the stale marker.
        mgr.finish("crawl", StreamEnd::LimitReached, 3, 3, "run-2")
            .await
            .unwrap();
        assert!(!mgr.is_complete("crawl").await);
    }

    #[tokio::test]
    async fn test_tracker_saves_every_n_and_resumes_lineage() {
        let tmp = TempDir::new().unwrap();
        let mgr = Arc::new(CheckpointManager::new(tmp.path()));

        let mut tracker = CheckpointTracker::new(mgr.clone(), "crawl", 3, None, 0, "run-a");
        let mut saves = 0;
        for offset in 1..=7 {
            if tracker.advance(offset).await.unwrap() {
                saves += 1;
            }
        }
        assert_eq!(saves, 2);
        assert_eq!(mgr.load("crawl").await.unwrap().last_offset, 6);
        assert!(tracker.flush().await.unwrap());
        assert!(!tracker.flush().await.unwrap());
        assert_eq!(mgr.load("crawl").await.unwrap().last_offset, 7);

        let cp = mgr.load("crawl").await.unwrap();
        let mut resumed = CheckpointTracker::new(mgr.clone(), "crawl", 3, Some(&cp), 0, "run-b");
        assert_eq!(resumed.run_id(), "run-a");
        assert_eq!(resumed.processed_count(), 7);
        resumed.advance(8).await.unwrap();
        resumed.flush().await.unwrap();
        let cp = mgr.load("crawl").await.unwrap();
        assert_eq!(cp.last_offset, 8);
        assert_eq!(cp.processed_count, 8);
        assert_eq!(cp.run_id, "run-a");
    }

    #[tokio::test]
    async fn test_hold_caps_saved_and_final_offset() {
        let tmp = TempDir::new().unwrap();
        let mgr = Arc::new(CheckpointManager::new(tmp.path()));

        let mut tracker = CheckpointTracker::new(mgr.clone(), "feed", 2, None, 0, "run-a");
        tracker.advance(1).await.unwrap();
        // The unit spanning offsets 1..2 failed.
        tracker.hold(1);
        tracker.advance(2).await.unwrap();
        assert_eq!(mgr.load("feed").await.unwrap().last_offset, 1);
        for offset in 3..=6 {
            tracker.advance(offset).await.unwrap();
        }
        tracker.hold(4);
        assert_eq!(tracker.last_offset(), 6);
        assert_eq!(tracker.resume_offset(), 1);
        assert!(!tracker.flush().await.unwrap());

        tracker.finish(StreamEnd::Exhausted).await.unwrap();
        assert_eq!(mgr.completion("feed").await.unwrap().final_offset, 1);
    }
}
