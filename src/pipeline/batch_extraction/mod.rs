//! Batch extraction: many PDFs, many workers, one durable store.
//!
//! ## Architecture
//!
//! ```text
//! scheduler → task channel → workers (N) → writer shards (W) → SQLite
//!                               │                  │
//!                               └─ events ─→ JobManager (+ supervisor)
//!                                      spill files ─┘ (reconciled at shutdown)
//! ```
//!
//! - Workers and writers are OS threads; all coordination is message passing
//!   over bounded `crossbeam` channels.
//! - The job manager owns every counter and the checkpoint.
//! - Results are upserted, so redelivery (fallback replay, retries, reruns)
//!   never duplicates rows.

pub mod checkpoint;
pub mod error;
pub mod fallback;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod supervisor;
pub mod types;
pub mod worker;
pub mod writer;

pub use checkpoint::{CheckpointError, CheckpointManager, CheckpointState};
pub use error::JobError;
pub use fallback::{reconcile, FallbackError, FallbackPersister, ReconcileStats};
pub use report::{export_rows_csv, export_summary_csv, JobReport, EXIT_INTERRUPTED};
pub use runner::{run_job, JobManager};
pub use scheduler::{discover_documents, select_tasks, SelectionMode};
pub use supervisor::ProgressSupervisor;
pub use types::*;
pub use writer::{shard_for, WriterConfig, WriterPool, WriterStats};
