//! Row and summary persistence.
//!
//! Every write is an upsert keyed so that delivering the same
//! `ExtractionResult` twice leaves the store unchanged.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, Transaction};

use super::DatabaseError;
use crate::models::{BomCell, BomRow, ErrorCode, ExtractionResult, Stage};

/// Per-file summary record, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSummary {
    pub file_path: PathBuf,
    pub file_name: String,
    pub success: bool,
    pub failing_stage: Option<Stage>,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub row_count: usize,
    pub page_count: usize,
    pub size_bytes: u64,
    pub memory_peak_mb: Option<f64>,
    pub attempt: u32,
}

/// What one upsert call touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub results: usize,
    pub rows: usize,
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn now_stamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Upsert a batch of results in one transaction.
pub fn upsert_results(
    conn: &mut Connection,
    results: &[ExtractionResult],
) -> Result<UpsertCounts, DatabaseError> {
    let tx = conn.transaction()?;
    let mut counts = UpsertCounts::default();
    for result in results {
        counts.rows += upsert_result_tx(&tx, result)?;
        counts.results += 1;
    }
    tx.commit()?;
    Ok(counts)
}

/// Upsert one result inside an open transaction. Returns the rows written.
///
/// The result replaces the file's row set, so a file that now fails keeps no
/// rows from an earlier run.
fn upsert_result_tx(tx: &Transaction<'_>, result: &ExtractionResult) -> Result<usize, DatabaseError> {
    let key = path_key(&result.filepath);
    let now = now_stamp();

    tx.execute("DELETE FROM bom_rows WHERE file_path = ?1", params![key])?;
    if result.success {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO bom_rows (file_path, page, row_index, file_name, cells, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (file_path, page, row_index) DO UPDATE SET
                file_name = excluded.file_name,
                cells = excluded.cells,
                updated_at = excluded.updated_at",
        )?;
        for row in &result.rows {
            let cells = serde_json::to_string(&row.cells)?;
            stmt.execute(params![
                path_key(&row.file_path),
                row.page as i64,
                row.row_index as i64,
                row.file_name,
                cells,
                now,
            ])?;
        }
    }

    tx.execute(
        "INSERT INTO file_summaries
         (file_path, file_name, success, failing_stage, error_code, error_message,
          duration_ms, row_count, page_count, size_bytes, memory_peak_mb, attempt, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT (file_path) DO UPDATE SET
            file_name = excluded.file_name,
            success = excluded.success,
            failing_stage = excluded.failing_stage,
            error_code = excluded.error_code,
            error_message = excluded.error_message,
            duration_ms = excluded.duration_ms,
            row_count = excluded.row_count,
            page_count = excluded.page_count,
            size_bytes = excluded.size_bytes,
            memory_peak_mb = excluded.memory_peak_mb,
            attempt = excluded.attempt,
            updated_at = excluded.updated_at",
        params![
            key,
            result.filename,
            result.success,
            result.failing_stage.map(|s| s.as_str()),
            result.error_code.as_str(),
            result.error_message,
            result.metrics.duration_ms as i64,
            result.row_count() as i64,
            result.metrics.page_count as i64,
            result.metrics.size_bytes as i64,
            result.metrics.memory_peak_mb,
            result.attempt,
            now,
        ],
    )?;

    Ok(if result.success { result.row_count() } else { 0 })
}

pub fn count_rows(conn: &Connection) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM bom_rows", [], |row| row.get(0))?;
    Ok(count as usize)
}

pub fn count_rows_for_file(conn: &Connection, path: &Path) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bom_rows WHERE file_path = ?1",
        params![path_key(path)],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// All rows, grouped by file and kept in page/row order within each file.
pub fn load_rows(conn: &Connection) -> Result<Vec<BomRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT file_path, page, row_index, file_name, cells
         FROM bom_rows
         ORDER BY file_path ASC, page ASC, row_index ASC",
    )?;
    let raw = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut rows = Vec::new();
    for item in raw {
        let (path, page, row_index, file_name, cells) = item?;
        let cells: Vec<BomCell> = serde_json::from_str(&cells)?;
        rows.push(BomRow {
            file_name,
            file_path: PathBuf::from(path),
            page: page as usize,
            row_index: row_index as usize,
            cells,
        });
    }
    Ok(rows)
}

pub fn load_summaries(conn: &Connection) -> Result<Vec<FileSummary>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT file_path, file_name, success, failing_stage, error_code, error_message,
                duration_ms, row_count, page_count, size_bytes, memory_peak_mb, attempt
         FROM file_summaries
         ORDER BY file_path ASC",
    )?;
    let raw = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, bool>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, i64>(6)?,
            row.get::<_, i64>(7)?,
            row.get::<_, i64>(8)?,
            row.get::<_, i64>(9)?,
            row.get::<_, Option<f64>>(10)?,
            row.get::<_, u32>(11)?,
        ))
    })?;

    let mut summaries = Vec::new();
    for item in raw {
        let (path, file_name, success, stage, code, message, duration, rows, pages, size, mem, attempt) =
            item?;
        summaries.push(FileSummary {
            file_path: PathBuf::from(path),
            file_name,
            success,
            failing_stage: stage.as_deref().map(Stage::from_str).transpose()?,
            error_code: ErrorCode::from_str(&code)?,
            error_message: message,
            duration_ms: duration as u64,
            row_count: rows as usize,
            page_count: pages as usize,
            size_bytes: size as u64,
            memory_peak_mb: mem,
            attempt,
        });
    }
    Ok(summaries)
}
