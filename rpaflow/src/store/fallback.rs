//! Local append-only log used while the primary repository is unreachable.
//!
//! Each line is one JSON [`LogEntry`]. The last entry for a run id wins.
//! Without a path the log lives only in memory.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::{PipelineRun, RunId};
use crate::errors::BackendError;

/// One line of the fallback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogEntry {
    /// Latest snapshot of a run.
    Snapshot {
        /// The run record.
        run: PipelineRun,
    },
    /// The run no longer needs the fallback (re-saved or deleted).
    Removed {
        /// The run id.
        run_id: RunId,
    },
}

/// Append-only fallback log with an in-memory index.
#[derive(Debug)]
pub struct FallbackLog {
    path: Option<PathBuf>,
    index: Mutex<HashMap<RunId, PipelineRun>>,
}

impl FallbackLog {
    /// A log that keeps entries in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the log at `path`, replaying existing entries.
    ///
    /// The file is created on first append. Corrupt lines are skipped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let path = path.into();
        let mut index = HashMap::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogEntry>(&line) {
                    Ok(LogEntry::Snapshot { run }) => {
                        index.insert(run.run_id, run);
                    }
                    Ok(LogEntry::Removed { run_id }) => {
                        index.remove(&run_id);
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "Skipping corrupt fallback log line"
                        );
                    }
                }
            }
            debug!(path = %path.display(), records = index.len(), "Fallback log replayed");
        }

        Ok(Self {
            path: Some(path),
            index: Mutex::new(index),
        })
    }

    /// The backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn append_line(&self, entry: &LogEntry) -> Result<(), BackendError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Appends the latest snapshot of a run.
    pub fn append(&self, run: &PipelineRun) -> Result<(), BackendError> {
        let mut index = self.index.lock();
        self.append_line(&LogEntry::Snapshot { run: run.clone() })?;
        index.insert(run.run_id, run.clone());
        Ok(())
    }

    /// Marks a run as no longer held by the log.
    ///
    /// The entry leaves the in-memory view even when the tombstone cannot be
    /// written; the error is still returned so the caller can log it.
    /// Returns false if the run was not in the log.
    pub fn remove(&self, run_id: RunId) -> Result<bool, BackendError> {
        let mut index = self.index.lock();
        if index.remove(&run_id).is_none() {
            return Ok(false);
        }
        self.append_line(&LogEntry::Removed { run_id })?;
        Ok(true)
    }

    /// Latest snapshot of a run.
    #[must_use]
    pub fn get(&self, run_id: RunId) -> Option<PipelineRun> {
        self.index.lock().get(&run_id).cloned()
    }

    /// Returns true if the log holds the run.
    #[must_use]
    pub fn contains(&self, run_id: RunId) -> bool {
        self.index.lock().contains_key(&run_id)
    }

    /// All runs held by the log.
    #[must_use]
    pub fn list(&self) -> Vec<PipelineRun> {
        self.index.lock().values().cloned().collect()
    }

    /// Number of runs held by the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    /// Returns true if the log holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Rewrites the file so it holds one snapshot per live run.
    pub fn compact(&self) -> Result<(), BackendError> {
        let index = self.index.lock();
        let Some(path) = &self.path else {
            return Ok(());
        };
        if index.is_empty() {
            if path.exists() {
                fs::remove_file(path)?;
            }
            return Ok(());
        }

        let tmp = path.with_extension("compact");
        {
            let mut file = File::create(&tmp)?;
            for run in index.values() {
                let mut line = serde_json::to_string(&LogEntry::Snapshot { run: run.clone() })?;
                line.push('\n');
                file.write_all(line.as_bytes())?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), records = index.len(), "Fallback log compacted");
        Ok(())
    }
}
