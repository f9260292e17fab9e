//! Pre-extraction file checks.
//!
//! Every expected problem becomes a `ValidationReport` carrying an
//! `ErrorCode`; the validator never returns `Err` and never panics on bad
//! input.

use std::path::Path;

use serde::Serialize;

use super::engine::{DocumentEngine, LoadedDocument};
use super::EngineError;
use crate::models::ErrorCode;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub code: ErrorCode,
    pub message: Option<String>,
    pub size_bytes: u64,
    pub page_count: usize,
}

impl ValidationReport {
    fn passed(size_bytes: u64, page_count: usize) -> Self {
        Self {
            ok: true,
            code: ErrorCode::None,
            message: None,
            size_bytes,
            page_count,
        }
    }

    fn rejected(code: ErrorCode, message: impl Into<String>, size_bytes: u64, page_count: usize) -> Self {
        Self {
            ok: false,
            code,
            message: Some(message.into()),
            size_bytes,
            page_count,
        }
    }
}

pub struct FileValidator<'a> {
    engine: &'a dyn DocumentEngine,
    max_size_bytes: u64,
}

impl<'a> FileValidator<'a> {
    pub fn new(engine: &'a dyn DocumentEngine, max_size_bytes: u64) -> Self {
        Self {
            engine,
            max_size_bytes,
        }
    }

    pub fn validate(&self, path: &Path) -> ValidationReport {
        self.validate_and_load(path).0
    }

    /// Run every check and hand back the opened document on success.
    pub fn validate_and_load(&self, path: &Path) -> (ValidationReport, Option<LoadedDocument>) {
        match self.check_file(path) {
            Ok(size) => self.check_document(path, size),
            Err(report) => (report, None),
        }
    }

    /// Filesystem checks: existence, size limit, emptiness. Returns the size.
    pub fn check_file(&self, path: &Path) -> Result<u64, ValidationReport> {
        let meta = std::fs::metadata(path).map_err(|e| {
            ValidationReport::rejected(ErrorCode::FileNotFound, format!("{}: {e}", path.display()), 0, 0)
        })?;
        if !meta.is_file() {
            return Err(ValidationReport::rejected(
                ErrorCode::FileNotFound,
                format!("{} is not a regular file", path.display()),
                0,
                0,
            ));
        }

        let size = meta.len();
        if size > self.max_size_bytes {
            return Err(ValidationReport::rejected(
                ErrorCode::FileTooLarge,
                format!("{size} bytes exceeds limit of {} bytes", self.max_size_bytes),
                size,
                0,
            ));
        }
        if size == 0 {
            return Err(ValidationReport::rejected(ErrorCode::FileEmpty, "file is empty", 0, 0));
        }
        Ok(size)
    }

    /// Document checks: openable, has pages, first page readable.
    pub fn check_document(&self, path: &Path, size: u64) -> (ValidationReport, Option<LoadedDocument>) {
        let document = match self.engine.load(path) {
            Ok(document) => document,
            Err(EngineError::Encrypted) => {
                return (
                    ValidationReport::rejected(ErrorCode::InvalidDocument, "document is encrypted", size, 0),
                    None,
                )
            }
            Err(e) => {
                return (
                    ValidationReport::rejected(ErrorCode::InvalidDocument, e.to_string(), size, 0),
                    None,
                )
            }
        };

        let pages = document.page_count();
        match document.first_page() {
            None => (
                ValidationReport::rejected(ErrorCode::NoPages, "document has no pages", size, 0),
                None,
            ),
            Some(Err(e)) => (
                ValidationReport::rejected(
                    ErrorCode::InvalidDocument,
                    format!("first page unreadable: {e}"),
                    size,
                    pages,
                ),
                None,
            ),
            Some(Ok(_)) => (ValidationReport::passed(size, pages), Some(document)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::fixtures::{
        bom_page, single_row_document, write_fixture, FixtureDocument, FixtureEngine,
    };

    const LIMIT: u64 = 1024 * 1024;

    fn check(path: &Path, limit: u64) -> ValidationReport {
        let engine = FixtureEngine::new();
        FileValidator::new(&engine, limit).validate(path)
    }

    #[test]
    fn valid_document_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "ok.pdf", &single_row_document("1"));
        let report = check(&path, LIMIT);
        assert!(report.ok);
        assert_eq!(report.code, ErrorCode::None);
        assert_eq!(report.page_count, 1);
        assert!(report.size_bytes > 0);
    }

    #[test]
    fn missing_file_and_directory_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(check(&dir.path().join("nope.pdf"), LIMIT).code, ErrorCode::FileNotFound);
        assert_eq!(check(dir.path(), LIMIT).code, ErrorCode::FileNotFound);
    }

    #[test]
    fn size_limit_checked_before_emptiness() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "big.pdf", &single_row_document("1"));
        let report = check(&path, 10);
        assert_eq!(report.code, ErrorCode::FileTooLarge);
        assert!(report.size_bytes > 10);
    }

    #[test]
    fn zero_byte_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pdf");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(check(&path, LIMIT).code, ErrorCode::FileEmpty);
    }

    #[test]
    fn garbage_is_invalid_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.pdf");
        std::fs::write(&path, b"%PDF-1.7 truncated").unwrap();
        let report = check(&path, LIMIT);
        assert_eq!(report.code, ErrorCode::InvalidDocument);
        assert!(report.message.is_some());
    }

    #[test]
    fn document_without_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "blank.pdf", &FixtureDocument::default());
        assert_eq!(check(&path, LIMIT).code, ErrorCode::NoPages);
    }

    #[test]
    fn unreadable_first_page_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let doc = FixtureDocument {
            pages: vec![bom_page(1, &[["1", "PIPE", "1"]]), bom_page(2, &[])],
            unreadable_pages: vec![1],
            ..FixtureDocument::default()
        };
        let path = write_fixture(dir.path(), "broken.pdf", &doc);
        let report = check(&path, LIMIT);
        assert_eq!(report.code, ErrorCode::InvalidDocument);
        assert_eq!(report.page_count, 2);
    }

    #[test]
    fn later_unreadable_page_still_passes() {
        let dir = tempfile::tempdir().unwrap();
        let doc = FixtureDocument {
            pages: vec![bom_page(1, &[["1", "PIPE", "1"]]), bom_page(2, &[])],
            unreadable_pages: vec![2],
            ..FixtureDocument::default()
        };
        let path = write_fixture(dir.path(), "partial.pdf", &doc);
        let engine = FixtureEngine::new();
        let (report, document) = FileValidator::new(&engine, LIMIT).validate_and_load(&path);
        assert!(report.ok);
        assert_eq!(document.unwrap().readable_pages().count(), 1);
    }

    #[test]
    fn code_is_none_exactly_when_ok() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pdf");
        std::fs::write(&empty, b"").unwrap();
        let junk = dir.path().join("junk.pdf");
        std::fs::write(&junk, b"not json").unwrap();
        let paths = vec![
            write_fixture(dir.path(), "ok.pdf", &single_row_document("7")),
            write_fixture(dir.path(), "blank.pdf", &FixtureDocument::default()),
            empty,
            junk,
            dir.path().join("missing.pdf"),
            dir.path().to_path_buf(),
        ];
        for limit in [0, 16, LIMIT] {
            for path in &paths {
                let report = check(path, limit);
                assert_eq!(report.code == ErrorCode::None, report.ok, "{}", path.display());
            }
        }
    }
}
