use std::path::Path;

use super::EngineError;
use crate::models::PageText;

/// A document opened by an engine: one entry per page, in page order.
///
/// Pages are loaded eagerly but fail independently, so one broken page does
/// not hide the others.
#[derive(Debug)]
pub struct LoadedDocument {
    pub pages: Vec<Result<PageText, EngineError>>,
}

impl LoadedDocument {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn first_page(&self) -> Option<&Result<PageText, EngineError>> {
        self.pages.first()
    }

    /// Readable pages only.
    pub fn readable_pages(&self) -> impl Iterator<Item = &PageText> {
        self.pages.iter().filter_map(|p| p.as_ref().ok())
    }
}

/// Produces positioned text for every page of a document.
///
/// Shared by all extraction workers through an `Arc`, so implementations
/// hold no per-document state.
pub trait DocumentEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, path: &Path) -> Result<LoadedDocument, EngineError>;
}
