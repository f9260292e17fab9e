//! Job report and CSV exports.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::JobError;
use super::fallback::ReconcileStats;
use super::types::JobState;
use super::writer::WriterStats;
use crate::db::FileSummary;
use crate::models::BomRow;
use crate::pipeline_config::WorkerPlan;

/// Exit code of an interrupted run.
pub const EXIT_INTERRUPTED: i32 = 2;

/// Aggregate statistics of one run.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub interrupted: bool,
    pub states: Vec<JobState>,
    pub plan: Option<WorkerPlan>,
    pub discovered: usize,
    pub scheduled: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Extra attempts queued by the retry policy.
    pub retried: usize,
    pub timed_out: usize,
    pub worker_errors: usize,
    pub rows: usize,
    pub fallback_deliveries: usize,
    pub lost_deliveries: usize,
    /// Scheduled but never handed to a worker (interrupt).
    pub not_started: usize,
    /// Started but without a final outcome when the job shut down.
    pub unfinished: usize,
    pub workers_spawned: usize,
    pub force_terminated: usize,
    pub stall_events: usize,
    pub reconciled: ReconcileStats,
    /// Checkpoint entries rewritten to match the store after reconciling.
    pub checkpoint_corrections: usize,
    pub writer_stats: Vec<WriterStats>,
    /// Final outcomes per error code, success included as `none`.
    pub error_counts: BTreeMap<String, usize>,
}

impl JobReport {
    pub fn new(job_id: String) -> Self {
        Self {
            job_id,
            started_at: Utc::now(),
            finished_at: None,
            interrupted: false,
            states: Vec::new(),
            plan: None,
            discovered: 0,
            scheduled: 0,
            dispatched: 0,
            succeeded: 0,
            failed: 0,
            retried: 0,
            timed_out: 0,
            worker_errors: 0,
            rows: 0,
            fallback_deliveries: 0,
            lost_deliveries: 0,
            not_started: 0,
            unfinished: 0,
            workers_spawned: 0,
            force_terminated: 0,
            stall_events: 0,
            reconciled: ReconcileStats::default(),
            checkpoint_corrections: 0,
            writer_stats: Vec::new(),
            error_counts: BTreeMap::new(),
        }
    }

    /// Files with a final outcome.
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else {
            0
        }
    }

    pub fn log_summary(&self) {
        let elapsed_ms = self
            .finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or_default();
        tracing::info!(
            job_id = %self.job_id,
            interrupted = self.interrupted,
            discovered = self.discovered,
            scheduled = self.scheduled,
            succeeded = self.succeeded,
            failed = self.failed,
            retried = self.retried,
            timed_out = self.timed_out,
            worker_errors = self.worker_errors,
            rows = self.rows,
            fallback = self.fallback_deliveries,
            not_started = self.not_started,
            elapsed_ms,
            "Job finished"
        );
        for (code, count) in &self.error_counts {
            tracing::info!(code = %code, count, "Outcome count");
        }
        if self.force_terminated > 0 {
            tracing::warn!(threads = self.force_terminated, "Threads force-terminated at shutdown");
        }
    }
}

fn csv_writer(path: &Path) -> Result<csv::Writer<std::fs::File>, JobError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    csv::Writer::from_path(path).map_err(|source| JobError::Output {
        path: path.to_path_buf(),
        source,
    })
}

/// Union of header names across `rows`, in first-seen order.
pub fn header_union(rows: &[BomRow]) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for row in rows {
        for header in row.headers() {
            if !headers.iter().any(|h| h == header) {
                headers.push(header.to_string());
            }
        }
    }
    headers
}

/// Write the row dataset. Returns the number of data rows written.
pub fn export_rows_csv(path: &Path, rows: &[BomRow]) -> Result<usize, JobError> {
    let output = |source| JobError::Output {
        path: path.to_path_buf(),
        source,
    };
    let headers = header_union(rows);
    let mut writer = csv_writer(path)?;

    let mut record: Vec<String> = ["source_path", "file_name", "page", "row_index"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    record.extend(headers.iter().cloned());
    writer.write_record(&record).map_err(output)?;

    for row in rows {
        let mut record = vec![
            row.file_path.to_string_lossy().into_owned(),
            row.file_name.clone(),
            row.page.to_string(),
            row.row_index.to_string(),
        ];
        record.extend(headers.iter().map(|h| row.get(h).unwrap_or_default().to_string()));
        writer.write_record(&record).map_err(output)?;
    }
    writer.flush()?;

    tracing::info!(path = %path.display(), rows = rows.len(), columns = headers.len(), "Row dataset exported");
    Ok(rows.len())
}

/// Write one summary line per file.
pub fn export_summary_csv(path: &Path, summaries: &[FileSummary]) -> Result<usize, JobError> {
    let output = |source| JobError::Output {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv_writer(path)?;
    writer
        .write_record([
            "file_name",
            "source_path",
            "success",
            "failing_stage",
            "error_code",
            "error_message",
            "duration_ms",
            "row_count",
            "page_count",
            "size_bytes",
            "memory_peak_mb",
            "attempt",
        ])
        .map_err(output)?;

    for s in summaries {
        writer
            .write_record([
                s.file_name.clone(),
                s.file_path.to_string_lossy().into_owned(),
                s.success.to_string(),
                s.failing_stage.map(|st| st.as_str().to_string()).unwrap_or_default(),
                s.error_code.as_str().to_string(),
                s.error_message.clone().unwrap_or_default(),
                s.duration_ms.to_string(),
                s.row_count.to_string(),
                s.page_count.to_string(),
                s.size_bytes.to_string(),
                s.memory_peak_mb.map(|m| format!("{m:.1}")).unwrap_or_default(),
                s.attempt.to_string(),
            ])
            .map_err(output)?;
    }
    writer.flush()?;

    tracing::info!(path = %path.display(), files = summaries.len(), "Summary exported");
    Ok(summaries.len())
}
