use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::enums::{ErrorCode, Stage};

/// One (header, value) pair of a BOM row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BomCell {
    pub header: String,
    pub value: String,
}

/// A parsed Bill-of-Materials row, tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BomRow {
    pub file_name: String,
    pub file_path: PathBuf,
    /// 1-based page number.
    pub page: usize,
    /// Position of the row within its page table, starting at 0.
    pub row_index: usize,
    /// Values in column order.
    pub cells: Vec<BomCell>,
}

impl BomRow {
    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|c| c.header == header)
            .map(|c| c.value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|c| c.header.as_str())
    }
}

/// Timing and resource figures recorded for one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetrics {
    pub duration_ms: u64,
    pub size_bytes: u64,
    pub page_count: usize,
    /// Process resident set size after the file, in MiB. Approximate: shared by
    /// every worker thread of the process.
    pub memory_peak_mb: Option<f64>,
}

/// The single outcome of processing one Task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub filename: String,
    pub filepath: PathBuf,
    pub success: bool,
    pub failing_stage: Option<Stage>,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    pub rows: Vec<BomRow>,
    pub metrics: ExtractionMetrics,
    pub attempt: u32,
}

impl ExtractionResult {
    pub fn succeeded(path: &Path, rows: Vec<BomRow>, metrics: ExtractionMetrics) -> Self {
        Self {
            filename: file_name_of(path),
            filepath: path.to_path_buf(),
            success: true,
            failing_stage: None,
            error_code: ErrorCode::None,
            error_message: None,
            rows,
            metrics,
            attempt: 1,
        }
    }

    pub fn failed(
        path: &Path,
        code: ErrorCode,
        message: impl Into<String>,
        metrics: ExtractionMetrics,
    ) -> Self {
        Self {
            filename: file_name_of(path),
            filepath: path.to_path_buf(),
            success: false,
            failing_stage: code.default_stage(),
            error_code: code,
            error_message: Some(message.into()),
            rows: Vec::new(),
            metrics,
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_carries_no_rows_and_default_stage() {
        let r = ExtractionResult::failed(
            Path::new("/drawings/a.pdf"),
            ErrorCode::FileEmpty,
            "File is empty",
            ExtractionMetrics::default(),
        );
        assert!(!r.success);
        assert_eq!(r.filename, "a.pdf");
        assert_eq!(r.failing_stage, Some(Stage::Validation));
        assert_eq!(r.row_count(), 0);
    }

    #[test]
    fn row_lookup_by_header() {
        let row = BomRow {
            file_name: "a.pdf".into(),
            file_path: "/d/a.pdf".into(),
            page: 1,
            row_index: 0,
            cells: vec![
                BomCell { header: "PT NO".into(), value: "1".into() },
                BomCell { header: "QTY".into(), value: "4".into() },
            ],
        };
        assert_eq!(row.get("QTY"), Some("4"));
        assert_eq!(row.get("SIZE"), None);
        assert_eq!(row.headers().collect::<Vec<_>>(), vec!["PT NO", "QTY"]);
    }

    #[test]
    fn result_survives_json_line() {
        let r = ExtractionResult::succeeded(
            Path::new("/d/b.pdf"),
            vec![],
            ExtractionMetrics { duration_ms: 12, size_bytes: 900, page_count: 1, memory_peak_mb: None },
        )
        .with_attempt(2);
        let line = serde_json::to_string(&r).unwrap();
        assert!(!line.contains('\n'));
        let back: ExtractionResult = serde_json::from_str(&line).unwrap();
        assert_eq!(back, r);
    }
}
