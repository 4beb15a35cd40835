//! Checkpointed progress state for resumable harvesting
//!
//! The checkpoint manager owns all engine-observable progress: which
//! partitions are fully searched, every identifier discovered so far (in
//! discovery order), which identifiers are extracted, and the failure
//! counter. Saves go through a temp file and an atomic rename, so a crash
//! mid-save never leaves a torn checkpoint observable to the next load.
//!
//! Identifiers are additionally appended to a flat raw file the moment they
//! are discovered. That file is replayed on load, so ids found after the
//! last structured save survive a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CheckpointConfig, PathsConfig};

/// Errors from checkpoint persistence
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Run statistics carried inside the checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestStats {
    pub total_discovered: usize,
    pub total_extracted: usize,
    pub errors: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_saved_at: Option<DateTime<Utc>>,
}

/// All engine-observable progress, persisted as one JSON document.
///
/// `discovered_ids` keeps discovery order so extraction consumes FIFO;
/// the companion set exists only for O(1) dedup and is rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    pub completed_partitions: HashSet<String>,
    pub discovered_ids: Vec<String>,
    pub extracted_ids: HashSet<String>,
    /// Identifiers that exhausted retries in some run; still pending,
    /// retried by future runs
    pub failed_ids: HashSet<String>,
    /// Partitions truncated at max depth and accepted as-is
    pub undercovered_partitions: Vec<String>,
    pub consecutive_failures: u32,
    pub stats: HarvestStats,
    #[serde(skip)]
    discovered_set: HashSet<String>,
}

impl ProgressState {
    fn rebuild_index(&mut self) {
        self.discovered_set = self.discovered_ids.iter().cloned().collect();
    }

    pub fn is_discovered(&self, id: &str) -> bool {
        self.discovered_set.contains(id)
    }
}

/// Point-in-time progress summary for reporting
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    pub partitions_completed: usize,
    pub total_discovered: usize,
    pub total_extracted: usize,
    pub pending_extraction: usize,
    pub failed: usize,
    pub undercovered: usize,
    pub errors: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_saved_at: Option<DateTime<Utc>>,
}

/// Durable, crash-safe owner of [`ProgressState`].
pub struct CheckpointManager {
    checkpoint_file: PathBuf,
    raw_ids_file: PathBuf,
    state: ProgressState,
    raw_handle: Option<File>,
    last_save: Instant,
    items_since_save: usize,
}

impl CheckpointManager {
    pub fn new(checkpoint_file: PathBuf, raw_ids_file: PathBuf) -> Self {
        Self {
            checkpoint_file,
            raw_ids_file,
            state: ProgressState::default(),
            raw_handle: None,
            last_save: Instant::now(),
            items_since_save: 0,
        }
    }

    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self::new(paths.checkpoint_file(), paths.raw_ids_file())
    }

    /// Load the checkpoint, returning whether one existed.
    ///
    /// Always replays the raw identifier file afterwards; ids written after
    /// the last structured save are recovered and folded back in.
    pub fn load(&mut self) -> Result<bool, CheckpointError> {
        let existed = self.checkpoint_file.exists();

        if existed {
            let json = fs::read_to_string(&self.checkpoint_file)?;
            self.state = serde_json::from_str(&json)?;
            self.state.rebuild_index();
            info!(
                "Checkpoint loaded: {} partitions complete, {} ids discovered, {} extracted",
                self.state.completed_partitions.len(),
                self.state.discovered_ids.len(),
                self.state.extracted_ids.len()
            );
        } else {
            debug!("No checkpoint at {}", self.checkpoint_file.display());
            self.state = ProgressState::default();
        }

        let recovered = self.recover_from_raw()?;
        if recovered > 0 {
            info!("Recovered {} ids from the raw backup file", recovered);
            self.save()?;
        }

        Ok(existed)
    }

    /// Replay the append-only id file, adding anything missing from state.
    fn recover_from_raw(&mut self) -> Result<usize, CheckpointError> {
        if !self.raw_ids_file.exists() {
            return Ok(0);
        }

        let reader = BufReader::new(File::open(&self.raw_ids_file)?);
        let mut recovered = 0;
        for line in reader.lines() {
            let id = line?;
            let id = id.trim();
            if !id.is_empty() && self.state.discovered_set.insert(id.to_string()) {
                self.state.discovered_ids.push(id.to_string());
                recovered += 1;
            }
        }
        self.state.stats.total_discovered = self.state.discovered_ids.len();
        Ok(recovered)
    }

    /// Save the checkpoint atomically (write temp file, rename into place).
    ///
    /// Safe to call from the interrupt path; a crash during the write never
    /// corrupts the previously committed file.
    pub fn save(&mut self) -> Result<(), CheckpointError> {
        if let Some(parent) = self.checkpoint_file.parent() {
            fs::create_dir_all(parent)?;
        }

        self.state.stats.total_discovered = self.state.discovered_ids.len();
        self.state.stats.total_extracted = self.state.extracted_ids.len();
        self.state.stats.last_saved_at = Some(Utc::now());

        let json = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.checkpoint_file.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.checkpoint_file)?;

        self.last_save = Instant::now();
        self.items_since_save = 0;
        debug!("Checkpoint saved to {}", self.checkpoint_file.display());
        Ok(())
    }

    /// Save if the configured cadence (items or elapsed time) is due.
    pub fn maybe_save(&mut self, cadence: &CheckpointConfig) -> Result<bool, CheckpointError> {
        if self.items_since_save >= cadence.items_interval
            || self.last_save.elapsed() >= cadence.time_interval()
        {
            self.save()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark the start of a session if this is the first.
    pub fn start_session(&mut self) {
        if self.state.stats.started_at.is_none() {
            self.state.stats.started_at = Some(Utc::now());
        }
    }

    /// Record a newly discovered identifier.
    ///
    /// Returns false for duplicates. New ids are appended and flushed to the
    /// raw backup file immediately, before any structured save happens.
    pub fn record_discovered(&mut self, id: &str) -> Result<bool, CheckpointError> {
        if !self.state.discovered_set.insert(id.to_string()) {
            return Ok(false);
        }
        self.state.discovered_ids.push(id.to_string());
        self.append_raw(id)?;
        Ok(true)
    }

    fn append_raw(&mut self, id: &str) -> Result<(), CheckpointError> {
        if self.raw_handle.is_none() {
            if let Some(parent) = self.raw_ids_file.parent() {
                fs::create_dir_all(parent)?;
            }
            self.raw_handle = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.raw_ids_file)?,
            );
        }
        // The handle is set just above; keep the borrow checker happy
        let handle = self.raw_handle.as_mut().ok_or_else(|| {
            CheckpointError::Io(std::io::Error::other("raw backup handle missing"))
        })?;
        writeln!(handle, "{}", id)?;
        handle.flush()?;
        Ok(())
    }

    /// Forget partition completion while keeping discovered identifiers.
    /// Used when a fresh enumeration pass is requested over existing data.
    pub fn clear_completed_partitions(&mut self) {
        self.state.completed_partitions.clear();
        self.state.undercovered_partitions.clear();
    }

    pub fn is_partition_complete(&self, key: &str) -> bool {
        self.state.completed_partitions.contains(key)
    }

    pub fn mark_partition_complete(&mut self, key: &str) {
        self.state.completed_partitions.insert(key.to_string());
        self.items_since_save += 1;
    }

    pub fn record_undercovered(&mut self, key: &str) {
        warn!("Partition {} truncated at max depth; coverage incomplete", key);
        self.state.undercovered_partitions.push(key.to_string());
    }

    pub fn is_extracted(&self, id: &str) -> bool {
        self.state.extracted_ids.contains(id)
    }

    pub fn mark_extracted(&mut self, id: &str) {
        self.state.extracted_ids.insert(id.to_string());
        self.state.failed_ids.remove(id);
        self.items_since_save += 1;
    }

    pub fn record_failed(&mut self, id: &str) {
        self.state.failed_ids.insert(id.to_string());
        self.state.stats.errors += 1;
    }

    pub fn increment_errors(&mut self) {
        self.state.stats.errors += 1;
    }

    /// Identifiers discovered but not yet extracted, in discovery order.
    pub fn pending_ids(&self) -> Vec<String> {
        self.state
            .discovered_ids
            .iter()
            .filter(|id| !self.state.extracted_ids.contains(*id))
            .cloned()
            .collect()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.consecutive_failures
    }

    pub fn set_consecutive_failures(&mut self, count: u32) {
        self.state.consecutive_failures = count;
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            partitions_completed: self.state.completed_partitions.len(),
            total_discovered: self.state.discovered_ids.len(),
            total_extracted: self.state.extracted_ids.len(),
            pending_extraction: self.pending_ids().len(),
            failed: self.state.failed_ids.len(),
            undercovered: self.state.undercovered_partitions.len(),
            errors: self.state.stats.errors,
            started_at: self.state.stats.started_at,
            last_saved_at: self.state.stats.last_saved_at,
        }
    }

    /// Destructively reset all progress and delete state files.
    pub fn reset(&mut self) -> Result<(), CheckpointError> {
        self.raw_handle = None;
        self.state = ProgressState::default();
        self.items_since_save = 0;

        for path in [&self.checkpoint_file, &self.raw_ids_file] {
            if path.exists() {
                fs::remove_file(path)?;
                info!("Deleted {}", path.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> CheckpointManager {
        CheckpointManager::new(
            dir.path().join("checkpoint.json"),
            dir.path().join("ids.raw.txt"),
        )
    }

    #[test]
    fn test_load_without_checkpoint_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut cp = manager(&dir);
        assert!(!cp.load().unwrap());
        assert_eq!(cp.pending_ids().len(), 0);
        assert_eq!(cp.summary().total_discovered, 0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut cp = manager(&dir);
        cp.record_discovered("NMW0001").unwrap();
        cp.record_discovered("MED0002").unwrap();
        cp.mark_partition_complete("A");
        cp.mark_extracted("NMW0001");
        cp.set_consecutive_failures(2);
        cp.save().unwrap();

        let mut reloaded = manager(&dir);
        assert!(reloaded.load().unwrap());
        assert!(reloaded.is_partition_complete("A"));
        assert!(reloaded.is_extracted("NMW0001"));
        assert_eq!(reloaded.consecutive_failures(), 2);
        assert_eq!(reloaded.pending_ids(), vec!["MED0002".to_string()]);
    }

    #[test]
    fn test_discovery_dedup() {
        let dir = TempDir::new().unwrap();
        let mut cp = manager(&dir);
        assert!(cp.record_discovered("NMW0001").unwrap());
        assert!(!cp.record_discovered("NMW0001").unwrap());
        assert_eq!(cp.summary().total_discovered, 1);
    }

    #[test]
    fn test_pending_keeps_discovery_order() {
        let dir = TempDir::new().unwrap();
        let mut cp = manager(&dir);
        for id in ["C3", "A1", "B2"] {
            cp.record_discovered(id).unwrap();
        }
        assert_eq!(cp.pending_ids(), vec!["C3", "A1", "B2"]);
    }

    #[test]
    fn test_raw_backup_recovery() {
        let dir = TempDir::new().unwrap();

        // Ids written to the raw file but never through a structured save,
        // as after a crash
        {
            let mut cp = manager(&dir);
            cp.record_discovered("NMW0001").unwrap();
            cp.save().unwrap();
            cp.record_discovered("NMW0002").unwrap();
            // No save; drop simulates the crash
        }

        let mut cp = manager(&dir);
        cp.load().unwrap();
        assert!(cp.state().is_discovered("NMW0002"));
        assert_eq!(cp.pending_ids(), vec!["NMW0001", "NMW0002"]);
    }

    #[test]
    fn test_stale_tmp_file_does_not_corrupt_load() {
        let dir = TempDir::new().unwrap();
        let mut cp = manager(&dir);
        cp.record_discovered("NMW0001").unwrap();
        cp.save().unwrap();

        // A crash mid-save leaves a torn temp file behind; the committed
        // checkpoint must still load
        std::fs::write(dir.path().join("checkpoint.json.tmp"), "{\"trunc").unwrap();

        let mut reloaded = manager(&dir);
        assert!(reloaded.load().unwrap());
        assert!(reloaded.state().is_discovered("NMW0001"));
    }

    #[test]
    fn test_maybe_save_item_cadence() {
        let dir = TempDir::new().unwrap();
        let mut cp = manager(&dir);
        let cadence = CheckpointConfig {
            items_interval: 2,
            time_interval_secs: 3600,
        };

        cp.mark_partition_complete("A");
        assert!(!cp.maybe_save(&cadence).unwrap());
        cp.mark_partition_complete("B");
        assert!(cp.maybe_save(&cadence).unwrap());
        // Counter reset after save
        assert!(!cp.maybe_save(&cadence).unwrap());
    }

    #[test]
    fn test_mark_extracted_clears_failed() {
        let dir = TempDir::new().unwrap();
        let mut cp = manager(&dir);
        cp.record_discovered("NMW0001").unwrap();
        cp.record_failed("NMW0001");
        assert_eq!(cp.summary().failed, 1);
        cp.mark_extracted("NMW0001");
        assert_eq!(cp.summary().failed, 0);
    }

    #[test]
    fn test_reset_deletes_files() {
        let dir = TempDir::new().unwrap();
        let mut cp = manager(&dir);
        cp.record_discovered("NMW0001").unwrap();
        cp.save().unwrap();
        cp.reset().unwrap();

        assert!(!dir.path().join("checkpoint.json").exists());
        assert!(!dir.path().join("ids.raw.txt").exists());

        let mut reloaded = manager(&dir);
        assert!(!reloaded.load().unwrap());
        assert_eq!(reloaded.summary().total_discovered, 0);
    }
}
