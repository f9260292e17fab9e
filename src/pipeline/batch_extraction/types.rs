//! Message protocol between the job manager, extraction workers and writers.
//!
//! Every message is moved through a bounded `crossbeam` channel; no message
//! is shared after it is sent.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ErrorCode, ExtractionResult};

pub type WorkerId = usize;

pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

// ═══════════════════════════════════════════
// Tasks
// ═══════════════════════════════════════════

/// One file to process. Consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub path: PathBuf,
    /// 1 for the first try.
    pub attempt: u32,
}

impl Task {
    pub fn new(path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
            attempt: 1,
        }
    }

    /// A fresh task for the same file, one attempt later.
    pub fn retry(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: self.path.clone(),
            attempt: self.attempt + 1,
        }
    }
}

/// Job manager → worker.
#[derive(Debug)]
pub enum WorkerCommand {
    Process(Task),
    /// Poison pill: finish the current file, then exit.
    Stop,
}

// ═══════════════════════════════════════════
// Worker events
// ═══════════════════════════════════════════

/// How a result reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Writer,
    Fallback,
    /// Neither the writer nor the spill file accepted it.
    Lost,
    /// Not written by the worker: the file overran its time budget and the
    /// job manager records the timeout itself.
    Withheld,
}

/// The compact outcome of one task, as seen by the job manager. The full
/// result travels to the writer tier instead.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOutcome {
    pub task_id: Uuid,
    pub path: PathBuf,
    pub attempt: u32,
    pub success: bool,
    pub error_code: ErrorCode,
    pub rows: usize,
    pub delivery: Delivery,
}

impl FileOutcome {
    pub fn of(task_id: Uuid, result: &ExtractionResult, delivery: Delivery) -> Self {
        Self {
            task_id,
            path: result.filepath.clone(),
            attempt: result.attempt,
            success: result.success,
            error_code: result.error_code,
            rows: result.rows.len(),
            delivery,
        }
    }
}

/// Worker (or its heartbeat ticker) → job manager.
#[derive(Debug)]
pub enum WorkerEvent {
    Heartbeat { worker_id: WorkerId, at: Instant },
    Started { worker_id: WorkerId, task_id: Uuid, at: Instant },
    Finished { worker_id: WorkerId, outcome: FileOutcome },
    /// Sent from a drop guard, so it also fires when the worker unwinds.
    Exited { worker_id: WorkerId },
}

/// Anyone → one writer shard.
#[derive(Debug)]
pub enum WriterMessage {
    Result(Box<ExtractionResult>),
    /// Flush what is buffered, then exit.
    Shutdown,
}

// ═══════════════════════════════════════════
// Job lifecycle
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Init,
    Discovering,
    Dispatching,
    Draining,
    ShuttingDown,
    Reconciling,
    Reporting,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Discovering => "discovering",
            Self::Dispatching => "dispatching",
            Self::Draining => "draining",
            Self::ShuttingDown => "shutting_down",
            Self::Reconciling => "reconciling",
            Self::Reporting => "reporting",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
