use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use super::anchor::find_anchor;
use super::boundary::{resolve_boundary, BoundaryError};
use super::columns::{map_columns, ColumnRules};
use super::engine::{DocumentEngine, LoadedDocument};
use super::rows::group_rows;
use super::validator::FileValidator;
use crate::config::LayoutSettings;
use crate::models::{file_name_of, BomCell, BomRow, ErrorCode, ExtractionMetrics, ExtractionResult, PageText};
use crate::pipeline_config::estimated_document_memory;

/// What one page yielded.
#[derive(Debug)]
enum PageOutcome {
    NoAnchor,
    Boundary(BoundaryError),
    Rows(Vec<BomRow>),
}

/// Validate → locate → resolve → group → map, for one file.
///
/// Stateless apart from configuration; one instance per worker.
pub struct ExtractionPipeline {
    engine: Arc<dyn DocumentEngine>,
    layout: LayoutSettings,
    rules: ColumnRules,
    max_file_size_bytes: u64,
    memory_budget_bytes: Option<u64>,
}

impl ExtractionPipeline {
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        layout: LayoutSettings,
        max_file_size_bytes: u64,
    ) -> Result<Self, regex::Error> {
        let rules = ColumnRules::from_layout(&layout)?;
        Ok(Self {
            engine,
            layout,
            rules,
            max_file_size_bytes,
            memory_budget_bytes: None,
        })
    }

    /// Reject documents whose estimated in-memory size exceeds `bytes`.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }

    /// Process one file. Never panics on bad input and never returns an
    /// error: every expected failure is a tagged `ExtractionResult`.
    pub fn process(&self, path: &Path) -> ExtractionResult {
        let started = Instant::now();
        let mut metrics = ExtractionMetrics::default();
        let validator = FileValidator::new(self.engine.as_ref(), self.max_file_size_bytes);

        let size = match validator.check_file(path) {
            Ok(size) => size,
            Err(report) => {
                metrics.size_bytes = report.size_bytes;
                metrics.duration_ms = elapsed_ms(started);
                return failure(path, report.code, report.message, metrics);
            }
        };
        metrics.size_bytes = size;

        if let Some(budget) = self.memory_budget_bytes {
            let estimate = estimated_document_memory(size);
            if estimate > budget {
                metrics.duration_ms = elapsed_ms(started);
                return ExtractionResult::failed(
                    path,
                    ErrorCode::MemoryLimitExceeded,
                    format!("estimated {estimate} bytes exceeds worker budget of {budget} bytes"),
                    metrics,
                );
            }
        }

        let (report, document) = validator.check_document(path, size);
        metrics.page_count = report.page_count;
        let document = match document {
            Some(document) if report.ok => document,
            _ => {
                metrics.duration_ms = elapsed_ms(started);
                return failure(path, report.code, report.message, metrics);
            }
        };

        let outcome = self.extract_document(path, &document);
        metrics.duration_ms = elapsed_ms(started);
        match outcome {
            Ok(rows) => {
                tracing::debug!(file = %path.display(), rows = rows.len(), "Extracted BOM rows");
                ExtractionResult::succeeded(path, rows, metrics)
            }
            Err((code, message)) => ExtractionResult::failed(path, code, message, metrics),
        }
    }

    /// Rows of every page that carries the anchor, in page order.
    fn extract_document(&self, path: &Path, document: &LoadedDocument) -> Result<Vec<BomRow>, (ErrorCode, String)> {
        let mut rows = Vec::new();
        let mut anchored_pages = 0usize;
        let mut first_failure: Option<BoundaryError> = None;

        for (index, page) in document.pages.iter().enumerate() {
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(file = %path.display(), page = index + 1, error = %e, "Skipping unreadable page");
                    continue;
                }
            };
            match self.extract_page(path, page) {
                PageOutcome::NoAnchor => {}
                PageOutcome::Boundary(e) => {
                    anchored_pages += 1;
                    tracing::debug!(file = %path.display(), page = page.number, error = %e, "Table not resolved");
                    first_failure.get_or_insert(e);
                }
                PageOutcome::Rows(page_rows) => {
                    anchored_pages += 1;
                    rows.extend(page_rows);
                }
            }
        }

        if anchored_pages == 0 {
            return Err((
                ErrorCode::AnchorNotFound,
                format!("\"{}\" not found on any page", self.layout.anchor_text),
            ));
        }
        if rows.is_empty() {
            return Err(match first_failure {
                Some(e) => (e.code(), e.to_string()),
                None => (ErrorCode::NoRowsExtracted, "table regions held no data rows".to_string()),
            });
        }
        Ok(rows)
    }

    fn extract_page(&self, path: &Path, page: &PageText) -> PageOutcome {
        let Some(anchor) = find_anchor(page, &self.layout.anchor_text) else {
            return PageOutcome::NoAnchor;
        };
        let table = match resolve_boundary(page, &anchor, &self.layout) {
            Ok(table) => table,
            Err(e) => return PageOutcome::Boundary(e),
        };

        let grouped = group_rows(&table.spans, self.layout.row_tolerance_y);
        let header_index = grouped
            .iter()
            .position(|row| row.iter().any(|s| s.bbox == anchor.bbox))
            .unwrap_or(0);
        let Some((header, data)) = grouped[header_index..].split_first() else {
            return PageOutcome::Rows(Vec::new());
        };

        let mapped = map_columns(header, data, &self.rules);
        if mapped.unmatched_cells > 0 {
            tracing::debug!(
                file = %path.display(),
                page = page.number,
                unmatched = mapped.unmatched_cells,
                "Dropped cells outside every column"
            );
        }

        let file_name = file_name_of(path);
        let rows = mapped
            .rows
            .into_iter()
            .enumerate()
            .map(|(row_index, values)| BomRow {
                file_name: file_name.clone(),
                file_path: path.to_path_buf(),
                page: page.number,
                row_index,
                cells: mapped
                    .headers
                    .iter()
                    .zip(values)
                    .map(|(header, value)| BomCell {
                        header: header.clone(),
                        value,
                    })
                    .collect(),
            })
            .collect();
        PageOutcome::Rows(rows)
    }
}

fn failure(path: &Path, code: ErrorCode, message: Option<String>, metrics: ExtractionMetrics) -> ExtractionResult {
    ExtractionResult::failed(path, code, message.unwrap_or_else(|| code.to_string()), metrics)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use crate::pipeline::extraction::fixtures::{
        bom_page, cover_page, single_row_document, span, write_fixture, FixtureDocument, FixtureEngine,
    };

    fn pipeline() -> ExtractionPipeline {
        ExtractionPipeline::new(Arc::new(FixtureEngine::new()), LayoutSettings::default(), 1 << 20).unwrap()
    }

    #[test]
    fn single_page_rows_are_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let doc = FixtureDocument {
            pages: vec![bom_page(1, &[["1", "PIPE SMLS", "12"], ["2", "ELBOW 90", "4"]])],
            ..FixtureDocument::default()
        };
        let path = write_fixture(dir.path(), "iso-1.pdf", &doc);
        let result = pipeline().process(&path);

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.error_code, ErrorCode::None);
        assert_eq!(result.failing_stage, None);
        assert_eq!(result.rows.len(), 2);
        let second = &result.rows[1];
        assert_eq!(second.file_name, "iso-1.pdf");
        assert_eq!(second.page, 1);
        assert_eq!(second.row_index, 1);
        assert_eq!(second.get("PT NO"), Some("2"));
        assert_eq!(second.get("DESCRIPTION"), Some("ELBOW 90"));
        assert_eq!(second.get("QTY"), Some("4"));
        assert_eq!(result.metrics.page_count, 1);
        assert!(result.metrics.size_bytes > 0);
    }

    #[test]
    fn pages_without_anchor_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let doc = FixtureDocument {
            pages: vec![cover_page(1), bom_page(2, &[["1", "TEE", "1"]]), bom_page(3, &[["7", "CAP", "2"]])],
            ..FixtureDocument::default()
        };
        let path = write_fixture(dir.path(), "multi.pdf", &doc);
        let result = pipeline().process(&path);
        assert!(result.success);
        let pages: Vec<usize> = result.rows.iter().map(|r| r.page).collect();
        assert_eq!(pages, vec![2, 3]);
        assert_eq!(result.rows[1].row_index, 0);
    }

    #[test]
    fn no_anchor_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        let doc = FixtureDocument {
            pages: vec![cover_page(1), cover_page(2)],
            ..FixtureDocument::default()
        };
        let path = write_fixture(dir.path(), "cover.pdf", &doc);
        let result = pipeline().process(&path);
        assert_eq!(result.error_code, ErrorCode::AnchorNotFound);
        assert_eq!(result.failing_stage, Some(Stage::AnchorSearch));
        assert!(result.rows.is_empty());
    }

    #[test]
    fn header_without_data_rows() {
        let dir = tempfile::tempdir().unwrap();
        let doc = FixtureDocument {
            pages: vec![bom_page(1, &[])],
            ..FixtureDocument::default()
        };
        let path = write_fixture(dir.path(), "empty-table.pdf", &doc);
        let result = pipeline().process(&path);
        assert_eq!(result.error_code, ErrorCode::NoRowsExtracted);
        assert_eq!(result.failing_stage, Some(Stage::RowParsing));
    }

    #[test]
    fn boundary_failure_is_reported_when_no_page_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let page = PageText {
            number: 1,
            width: 612.0,
            height: 792.0,
            spans: vec![
                span("PT NO", 50.0, 100.0, 80.0, 110.0),
                span("DESCRIPTION", 100.0, 100.0, 200.0, 110.0),
            ],
        };
        let doc = FixtureDocument {
            pages: vec![page],
            ..FixtureDocument::default()
        };
        let path = write_fixture(dir.path(), "no-term.pdf", &doc);
        let result = pipeline().process(&path);
        assert_eq!(result.error_code, ErrorCode::TerminatorNotFound);
        assert_eq!(result.failing_stage, Some(Stage::BoundaryResolution));
    }

    #[test]
    fn validation_failures_carry_validation_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.pdf");
        std::fs::write(&path, b"").unwrap();
        let result = pipeline().process(&path);
        assert_eq!(result.error_code, ErrorCode::FileEmpty);
        assert_eq!(result.failing_stage, Some(Stage::Validation));
        assert_eq!(result.filename, "zero.pdf");
    }

    #[test]
    fn memory_guard_rejects_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "big.pdf", &single_row_document("1"));
        let engine = Arc::new(FixtureEngine::new());
        let pipeline = ExtractionPipeline::new(engine.clone(), LayoutSettings::default(), 1 << 20)
            .unwrap()
            .with_memory_budget(16);
        let result = pipeline.process(&path);
        assert_eq!(result.error_code, ErrorCode::MemoryLimitExceeded);
        assert_eq!(result.failing_stage, Some(Stage::ResourceCheck));
        assert_eq!(engine.load_count(), 0);
    }

    #[test]
    fn output_is_deterministic_within_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let doc = FixtureDocument {
            pages: vec![bom_page(1, &[["1", "A", "1"], ["2", "B", "1"], ["3", "C", "1"]])],
            ..FixtureDocument::default()
        };
        let path = write_fixture(dir.path(), "same.pdf", &doc);
        let p = pipeline();
        assert_eq!(p.process(&path).rows, p.process(&path).rows);
    }
}
