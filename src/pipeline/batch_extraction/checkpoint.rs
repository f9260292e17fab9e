//! Run state persisted between jobs.
//!
//! The checkpoint is rewritten wholesale: serialize to a temp file in the
//! same directory, fsync, then rename over the old one. A reader therefore
//! sees either the previous state or the new one, never a torn file.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Checkpoint {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Cannot replace checkpoint {path}: {source}")]
    Persist {
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default)]
    pub completed: BTreeSet<PathBuf>,
    #[serde(default)]
    pub failed: BTreeSet<PathBuf>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CheckpointState {
    pub fn mark_completed(&mut self, path: &Path) {
        self.failed.remove(path);
        self.completed.insert(path.to_path_buf());
    }

    pub fn mark_failed(&mut self, path: &Path) {
        self.completed.remove(path);
        self.failed.insert(path.to_path_buf());
    }

    /// Record `path` as completed or failed unless it already is. Returns
    /// true when the entry changed.
    pub fn settle(&mut self, path: &Path, success: bool) -> bool {
        let current = if success { &self.completed } else { &self.failed };
        if current.contains(path) {
            return false;
        }
        if success {
            self.mark_completed(path);
        } else {
            self.mark_failed(path);
        }
        true
    }

    /// Completed or failed in an earlier run.
    pub fn is_processed(&self, path: &Path) -> bool {
        self.completed.contains(path) || self.failed.contains(path)
    }
}

pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint. A missing file is an empty state; an unreadable
    /// or corrupt one is an error, so a resume never silently restarts.
    pub fn load(&self) -> Result<CheckpointState, CheckpointError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointState::default())
            }
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Stamp `updated_at` and replace the checkpoint atomically.
    pub fn save(&self, state: &mut CheckpointState) -> Result<(), CheckpointError> {
        state.updated_at = Some(Utc::now());
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let json = serde_json::to_vec_pretty(state).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|source| CheckpointError::Persist {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(
            path = %self.path.display(),
            completed = state.completed.len(),
            failed = state.failed.len(),
            "Checkpoint saved"
        );
        Ok(())
    }
}
