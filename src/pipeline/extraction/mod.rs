pub mod anchor;
pub mod boundary;
pub mod columns;
pub mod engine;
pub mod orchestrator;
pub mod pdfium;
pub mod rows;
pub mod validator;

#[cfg(test)]
pub mod fixtures;

pub use anchor::*;
pub use boundary::*;
pub use columns::*;
pub use engine::*;
pub use orchestrator::*;
pub use rows::*;
pub use validator::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDFium library unavailable: {0}")]
    Library(String),

    #[error("Cannot open document {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Document is encrypted")]
    Encrypted,

    #[error("Page {page} unreadable: {reason}")]
    Page { page: usize, reason: String },
}
