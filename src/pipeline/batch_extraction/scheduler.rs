//! Discovery and task selection: which PDFs this run should process.
//!
//! Selection rules:
//! - Fresh run: every discovered file
//! - Resume: skip files the checkpoint records as completed or failed
//! - Retry-failed-only: exactly the checkpoint's failed files
//! - `max_files` caps the selection after filtering

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::checkpoint::CheckpointState;
use super::error::JobError;
use super::types::Task;

const PDF_EXTENSION: &str = "pdf";

/// Every `.pdf` (any case) under `root`, sorted by path.
pub fn discover_documents(root: &Path) -> Result<Vec<PathBuf>, JobError> {
    if !root.is_dir() {
        return Err(JobError::InputNotFound(root.to_path_buf()));
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        if entry.file_type().is_file() && is_pdf(entry.path()) {
            found.push(entry.into_path());
        }
    }
    found.sort();

    tracing::info!(root = %root.display(), files = found.len(), "Discovery complete");
    Ok(found)
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PDF_EXTENSION))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Fresh,
    Resume,
    RetryFailed,
}

impl SelectionMode {
    /// Retry-failed-only implies reading the checkpoint, so it wins over
    /// plain resume.
    pub fn from_flags(resume: bool, retry_failed_only: bool) -> Self {
        match (resume, retry_failed_only) {
            (_, true) => Self::RetryFailed,
            (true, false) => Self::Resume,
            (false, false) => Self::Fresh,
        }
    }

    pub fn uses_checkpoint(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

/// Build the task list for this run.
///
/// In retry mode the checkpoint's failed set is used as-is, even for files
/// discovery no longer sees; the validator will report those as missing.
pub fn select_tasks(
    discovered: &[PathBuf],
    checkpoint: &CheckpointState,
    mode: SelectionMode,
    max_files: Option<usize>,
) -> Vec<Task> {
    let selected: Vec<PathBuf> = match mode {
        SelectionMode::Fresh => discovered.to_vec(),
        SelectionMode::Resume => discovered
            .iter()
            .filter(|p| !checkpoint.is_processed(p))
            .cloned()
            .collect(),
        SelectionMode::RetryFailed => checkpoint.failed.iter().cloned().collect(),
    };

    let limit = max_files.unwrap_or(usize::MAX);
    let tasks: Vec<Task> = selected.into_iter().take(limit).map(Task::new).collect();

    tracing::info!(
        mode = ?mode,
        discovered = discovered.len(),
        selected = tasks.len(),
        "Tasks selected"
    );
    tasks
}
