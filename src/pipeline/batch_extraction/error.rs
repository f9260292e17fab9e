//! Job-level error types.
//!
//! Only setup and bookkeeping failures surface here. Per-file problems are
//! `ErrorCode`s on an `ExtractionResult` and never become a `JobError`.

use std::path::PathBuf;

use thiserror::Error;

use super::checkpoint::CheckpointError;
use super::fallback::FallbackError;
use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::pipeline::extraction::EngineError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Fallback error: {0}")]
    Fallback(#[from] FallbackError),

    #[error("Document engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid layout rule: {0}")]
    Layout(#[from] regex::Error),

    #[error("Input directory not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Discovery error: {0}")]
    Discovery(#[from] walkdir::Error),

    #[error("Cannot write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
