//! Checkpoint state management for resumable filtering runs.
//!
//! Epistemic foundation:
//! - K_i: Checkpoints record one decision per processed row, in row order
//! - K_i: State is persisted to disk atomically (write-then-rename)
//! - K_i: Accumulated decisions are never rolled back, only written out
//! - B_i: State file may not exist, or may belong to another dataset or to
//!   other decision settings → fresh start
//! - I^B: Crash during write → backup file provides recovery

use super::write_kept_rows;
use crate::classifier::Readiness;
use crate::models::{Dataset, Result, RunStats, SieveError, TableFormat};
use crate::provider::AnswerTokens;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Everything that influences a row's decision.
///
/// K_i: Decisions recorded under one signature are never mixed with
/// decisions made under another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSignature {
    /// Prompt template as written
    pub prompt: String,
    /// Confidence threshold
    pub threshold: f64,
    /// Readiness gate
    pub readiness: Readiness,
    /// Answer ids, which pin the tokenizer
    pub answers: AnswerTokens,
    /// Decision for missing or corrupted images
    pub keep_on_corrupted: bool,
}

/// Accumulated state of a filtering run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Dataset the decisions belong to
    pub dataset: PathBuf,
    /// Settings the decisions were made under
    pub signature: RunSignature,
    /// Rows in the dataset
    pub total_rows: usize,
    /// One decision per processed row, `true` = keep
    pub results: Vec<bool>,
    /// Rows whose image was missing or corrupted
    pub corrupted: usize,
    /// Rows kept because the attempt limit was reached
    pub exhausted: usize,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    /// Create an empty state for a dataset.
    pub fn new(dataset: &Dataset, signature: RunSignature) -> Self {
        let now = Utc::now();
        Self {
            dataset: dataset.path().to_path_buf(),
            signature,
            total_rows: dataset.len(),
            results: Vec::with_capacity(dataset.len()),
            corrupted: 0,
            exhausted: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Whether this state was produced for the given dataset.
    pub fn matches(&self, dataset: &Dataset) -> bool {
        self.dataset == dataset.path()
            && self.total_rows == dataset.len()
            && self.results.len() <= self.total_rows
    }

    /// Rows decided so far.
    pub fn processed(&self) -> usize {
        self.results.len()
    }

    /// Rows kept so far.
    pub fn kept(&self) -> usize {
        self.results.iter().filter(|&&keep| keep).count()
    }

    /// Record a classifier decision.
    pub fn record(&mut self, keep: bool) {
        self.results.push(keep);
        self.updated_at = Utc::now();
    }

    /// Record a classifier decision that fell back on the attempt limit.
    pub fn record_exhausted(&mut self) {
        self.exhausted += 1;
        self.record(true);
    }

    /// Record the configured default for a missing or corrupted image.
    pub fn record_corrupted(&mut self, keep: bool) {
        self.corrupted += 1;
        self.record(keep);
    }

    /// Check if every row has a decision.
    pub fn is_complete(&self) -> bool {
        self.results.len() >= self.total_rows
    }

    /// Get progress percentage.
    pub fn progress_percent(&self) -> f64 {
        if self.total_rows == 0 {
            return 100.0;
        }
        (self.results.len() as f64 / self.total_rows as f64) * 100.0
    }

    /// Convert to RunStats.
    pub fn to_run_stats(&self, resumed: usize, runtime_secs: f64) -> RunStats {
        let kept = self.kept();
        let mut stats = RunStats {
            total_rows: self.total_rows,
            processed: self.processed().saturating_sub(resumed),
            resumed,
            kept,
            discarded: self.processed() - kept,
            corrupted: self.corrupted,
            exhausted: self.exhausted,
            runtime_secs,
            ..Default::default()
        };
        stats.finalize();
        stats
    }
}

/// Checkpoint manager for the filtered table and its run state.
///
/// The filtered table at `output_path` is the artifact users consume; the
/// JSON sidecar next to it only exists to resume interrupted runs.
pub struct CheckpointManager {
    /// Filtered table path
    output_path: PathBuf,
    /// Path to run state file
    state_path: PathBuf,
    /// Path to backup file
    backup_path: PathBuf,
    /// Layout of the filtered table
    format: TableFormat,
    /// Rows between checkpoint writes
    every: Option<usize>,
    /// Rows processed since the last write
    since_last: usize,
    /// Whether to pick up a previous compatible state
    resume: bool,
    /// Writes performed by this manager
    writes: usize,
}

impl CheckpointManager {
    /// Create a new checkpoint manager.
    pub fn new(output_path: &Path, format: TableFormat, every: Option<usize>) -> Self {
        Self {
            output_path: output_path.to_path_buf(),
            state_path: sidecar(output_path, "state.json"),
            backup_path: sidecar(output_path, "state.backup.json"),
            format,
            every,
            since_last: 0,
            resume: false,
            writes: 0,
        }
    }

    /// Enable or disable resuming from an existing state file.
    pub fn resuming(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Check if a state file exists.
    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    /// Initialize a new state or load a compatible existing one.
    pub fn init_or_load(
        &mut self,
        dataset: &Dataset,
        signature: &RunSignature,
    ) -> Result<CheckpointState> {
        self.since_last = 0;

        if self.resume && self.exists() {
            let state = self.load()?;
            if !state.matches(dataset) {
                warn!(
                    state = %self.state_path.display(),
                    "Checkpoint belongs to a different dataset, starting fresh"
                );
            } else if state.signature != *signature {
                warn!(
                    state = %self.state_path.display(),
                    previous = ?state.signature,
                    current = ?signature,
                    "Checkpoint was made with different filter settings, starting fresh"
                );
            } else {
                info!(
                    processed = state.processed(),
                    kept = state.kept(),
                    progress = format!("{:.1}%", state.progress_percent()),
                    "Resuming from checkpoint"
                );
                return Ok(state);
            }
        }

        Ok(CheckpointState::new(dataset, signature.clone()))
    }

    /// Load state from disk.
    pub fn load(&self) -> Result<CheckpointState> {
        let file = File::open(&self.state_path)
            .map_err(|e| SieveError::io("opening checkpoint state", e))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .map_err(|e| SieveError::ParseError(format!("Invalid checkpoint: {e}")))
    }

    /// Whether the configured interval has elapsed since the last write.
    pub fn is_due(&self) -> bool {
        self.every.is_some_and(|every| self.since_last >= every)
    }

    /// Count one more processed row towards the interval.
    pub fn record_row(&mut self) {
        self.since_last += 1;
    }

    /// Write the filtered table and the run state, then reset the interval.
    pub fn save(&mut self, dataset: &Dataset, state: &CheckpointState) -> Result<usize> {
        let kept = write_kept_rows(&self.output_path, dataset, &state.results, self.format)?;
        self.save_state(state)?;

        self.since_last = 0;
        self.writes += 1;
        Ok(kept)
    }

    /// Save run state to disk (atomic write).
    fn save_state(&self, state: &CheckpointState) -> Result<()> {
        // Backup existing checkpoint
        if self.state_path.exists() {
            fs::copy(&self.state_path, &self.backup_path)
                .map_err(|e| SieveError::io("backing up checkpoint", e))?;
        }

        // Write to temp file
        let temp_path = sidecar(&self.output_path, "state.tmp.json");
        let file =
            File::create(&temp_path).map_err(|e| SieveError::io("creating temp checkpoint", e))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, state)
            .map_err(|e| SieveError::Internal(format!("Serializing checkpoint: {e}")))?;

        // Atomic rename
        fs::rename(&temp_path, &self.state_path)
            .map_err(|e| SieveError::io("renaming checkpoint", e))?;

        debug!(processed = state.processed(), "Checkpoint saved");
        Ok(())
    }

    /// Checkpoint writes performed so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Filtered table path.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Run state path.
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }
}

/// `<output>.<suffix>` next to the output file.
fn sidecar(output_path: &Path, suffix: &str) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    output_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn signature() -> RunSignature {
        RunSignature {
            prompt: "Is this a cat? {caption}".to_string(),
            threshold: 0.5,
            readiness: Readiness::default(),
            answers: AnswerTokens { yes: 16, no: 15 },
            keep_on_corrupted: false,
        }
    }

    fn dataset(rows: usize) -> Dataset {
        Dataset::from_rows(
            "meta.tsv",
            Some(&["caption"][..]),
            (0..rows).map(|i| vec![format!("caption {i}")]),
        )
    }

    #[test]
    fn test_interval_and_reset() {
        let dir = TempDir::new().unwrap();
        let ds = dataset(4);
        let mut mgr =
            CheckpointManager::new(&dir.path().join("out.tsv"), TableFormat::default(), Some(2));
        let mut state = mgr.init_or_load(&ds, &signature()).unwrap();

        assert!(!mgr.is_due());
        mgr.record_row();
        state.record(true);
        assert!(!mgr.is_due());
        mgr.record_row();
        state.record(false);
        assert!(mgr.is_due());

        assert_eq!(mgr.save(&ds, &state).unwrap(), 1);
        assert!(!mgr.is_due());
        assert_eq!(mgr.writes(), 1);
    }

    #[test]
    fn test_disabled_interval_never_due() {
        let dir = TempDir::new().unwrap();
        let mut mgr = CheckpointManager::new(&dir.path().join("out.tsv"), TableFormat::default(), None);
        for _ in 0..100 {
            mgr.record_row();
        }
        assert!(!mgr.is_due());
    }

    #[test]
    fn test_resume_loads_matching_state() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.tsv");
        let ds = dataset(5);

        let mut mgr = CheckpointManager::new(&out, TableFormat::default(), Some(1));
        let mut state = mgr.init_or_load(&ds, &signature()).unwrap();
        state.record(true);
        state.record_corrupted(false);
        state.record_exhausted();
        mgr.save(&ds, &state).unwrap();
        mgr.save(&ds, &state).unwrap();

        assert!(mgr.state_path().exists());
        assert!(sidecar(&out, "state.backup.json").exists());

        let mut resumed = CheckpointManager::new(&out, TableFormat::default(), Some(1)).resuming(true);
        let loaded = resumed.init_or_load(&ds, &signature()).unwrap();
        assert_eq!(loaded.results, vec![true, false, true]);
        assert_eq!(loaded.corrupted, 1);
        assert_eq!(loaded.exhausted, 1);

        let fresh = CheckpointManager::new(&out, TableFormat::default(), Some(1))
            .init_or_load(&ds, &signature())
            .unwrap();
        assert!(fresh.results.is_empty());
    }

    #[test]
    fn test_resume_ignores_other_dataset() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.tsv");

        let mut mgr = CheckpointManager::new(&out, TableFormat::default(), None);
        let mut state = mgr.init_or_load(&dataset(3), &signature()).unwrap();
        state.record(true);
        mgr.save(&dataset(3), &state).unwrap();

        let mut resumed = CheckpointManager::new(&out, TableFormat::default(), None).resuming(true);
        let loaded = resumed.init_or_load(&dataset(7), &signature()).unwrap();
        assert_eq!(loaded.processed(), 0);
        assert_eq!(loaded.total_rows, 7);
    }

    #[test]
    fn test_resume_ignores_changed_settings() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.tsv");
        let ds = dataset(4);

        let mut mgr = CheckpointManager::new(&out, TableFormat::default(), None);
        let mut state = mgr.init_or_load(&ds, &signature()).unwrap();
        state.record(true);
        state.record(true);
        mgr.save(&ds, &state).unwrap();

        let stricter = RunSignature {
            threshold: 0.9,
            ..signature()
        };
        let mut resumed = CheckpointManager::new(&out, TableFormat::default(), None).resuming(true);
        let loaded = resumed.init_or_load(&ds, &stricter).unwrap();
        assert_eq!(loaded.processed(), 0);
        assert_eq!(loaded.signature, stricter);

        let reworded = RunSignature {
            prompt: "Is this a dog? {caption}".to_string(),
            ..signature()
        };
        let mut resumed = CheckpointManager::new(&out, TableFormat::default(), None).resuming(true);
        assert_eq!(resumed.init_or_load(&ds, &reworded).unwrap().processed(), 0);

        let mut resumed = CheckpointManager::new(&out, TableFormat::default(), None).resuming(true);
        assert_eq!(resumed.init_or_load(&ds, &signature()).unwrap().processed(), 2);
    }

    #[test]
    fn test_to_run_stats() {
        let mut state = CheckpointState::new(&dataset(4), signature());
        state.record(true);
        state.record(false);
        state.record_corrupted(true);
        let stats = state.to_run_stats(1, 0.0);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.resumed, 1);
        assert_eq!(stats.kept, 2);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.corrupted, 1);
        assert!(!state.is_complete());
        assert!((state.progress_percent() - 75.0).abs() < 1e-9);
    }
}
