//! Spill files for results the writer tier could not take.
//!
//! Each producer appends JSON lines to its own file in the fallback
//! directory and syncs after every line. After shutdown the job manager
//! replays every spill file through the normal upsert path and removes it.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

use crate::db::{upsert_results, DatabaseError};
use crate::models::ExtractionResult;

const SPILL_EXTENSION: &str = "jsonl";

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("Spill file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Replay failed: {0}")]
    Database(#[from] DatabaseError),
}

pub struct FallbackPersister {
    path: PathBuf,
    file: Option<File>,
    written: usize,
}

impl FallbackPersister {
    pub fn for_worker(dir: &Path, worker_id: usize) -> Self {
        Self::named(dir, &format!("worker-{worker_id}"))
    }

    pub fn for_writer(dir: &Path, writer_id: usize) -> Self {
        Self::named(dir, &format!("writer-{writer_id}"))
    }

    /// Spill file for results the job manager synthesizes itself.
    pub fn for_manager(dir: &Path) -> Self {
        Self::named(dir, "manager")
    }

    fn named(dir: &Path, stem: &str) -> Self {
        Self {
            path: dir.join(format!("{stem}.{SPILL_EXTENSION}")),
            file: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Append one result and sync it to disk. The file is opened lazily, so
    /// producers that never spill leave nothing behind.
    pub fn persist(&mut self, result: &ExtractionResult) -> Result<(), FallbackError> {
        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let path = self.path.clone();
        let io_err = |source| FallbackError::Io {
            path: path.clone(),
            source,
        };

        if self.file.is_none() {
            if let Some(dir) = self.path.parent() {
                std::fs::create_dir_all(dir).map_err(io_err)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(io_err)?;
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(line.as_bytes()).map_err(io_err)?;
            file.sync_data().map_err(io_err)?;
        }
        self.written += 1;
        Ok(())
    }
}

/// What a replay pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub files: usize,
    pub results: usize,
    pub rows: usize,
    pub skipped_lines: usize,
}

/// Spill files in `dir`, sorted. A missing directory has none.
pub fn spill_files(dir: &Path) -> Result<Vec<PathBuf>, FallbackError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(FallbackError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == SPILL_EXTENSION))
        .collect();
    files.sort();
    Ok(files)
}

/// Parse a spill file. Torn or corrupt lines are skipped and counted.
pub fn read_spill(path: &Path) -> Result<(Vec<ExtractionResult>, usize), FallbackError> {
    let file = File::open(path).map_err(|source| FallbackError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut results = Vec::new();
    let mut skipped = 0;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(file = %path.display(), line = index + 1, error = %e, "Unreadable spill line");
                skipped += 1;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ExtractionResult>(&line) {
            Ok(result) => results.push(result),
            Err(e) => {
                tracing::warn!(file = %path.display(), line = index + 1, error = %e, "Skipping corrupt spill line");
                skipped += 1;
            }
        }
    }
    Ok((results, skipped))
}

/// Replay every spill file into the store, then delete it.
pub fn reconcile(dir: &Path, conn: &mut Connection) -> Result<ReconcileStats, FallbackError> {
    let mut stats = ReconcileStats::default();
    for path in spill_files(dir)? {
        let (results, skipped) = read_spill(&path)?;
        let counts = upsert_results(conn, &results)?;
        std::fs::remove_file(&path).map_err(|source| FallbackError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::info!(
            file = %path.display(),
            results = counts.results,
            rows = counts.rows,
            skipped,
            "Replayed spill file"
        );
        stats.files += 1;
        stats.results += counts.results;
        stats.rows += counts.rows;
        stats.skipped_lines += skipped;
    }
    Ok(stats)
}
