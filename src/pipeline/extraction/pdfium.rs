//! Positioned text extraction via Google PDFium.
//!
//! `PdfiumEngine` is stateless (`Send + Sync`). Each load binds a fresh
//! `Pdfium` instance because the upstream type is `!Send`; the OS caches
//! `dlopen`/`LoadLibrary`, so repeat binds are near-free. With the
//! `thread_safe` feature PDFium calls are serialized inside the library.

use std::path::{Path, PathBuf};

use pdfium_render::prelude::*;
use tracing::debug;

use super::engine::{DocumentEngine, LoadedDocument};
use super::EngineError;
use crate::models::{BBox, PageText, TextSpan};

pub struct PdfiumEngine {
    library_path: Option<PathBuf>,
}

impl PdfiumEngine {
    /// Create an engine, verifying the PDFium library is loadable.
    ///
    /// Discovery order:
    /// 1. `library_path` (from `pdfium_library_path` in the settings)
    /// 2. `PDFIUM_DYNAMIC_LIB_PATH` env var
    /// 3. Alongside the running executable, or its `pdfium/` and `lib/` subdirs
    /// 4. System library search paths
    pub fn new(library_path: Option<PathBuf>) -> Result<Self, EngineError> {
        let _ = load_pdfium(library_path.as_deref())?;
        Ok(Self { library_path })
    }
}

fn load_pdfium(explicit: Option<&Path>) -> Result<Pdfium, EngineError> {
    if let Some(path) = explicit {
        let path = path.to_string_lossy().into_owned();
        debug!(path = %path, "Loading PDFium from configured path");
        return Pdfium::bind_to_library(&path)
            .map(Pdfium::new)
            .map_err(|e| EngineError::Library(format!("Failed to load PDFium from {path}: {e}")));
    }

    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        debug!(path = %path, "Loading PDFium from env var");
        return Pdfium::bind_to_library(&path)
            .map(Pdfium::new)
            .map_err(|e| EngineError::Library(format!("Failed to load PDFium from {path}: {e}")));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let candidates = [
                exe_dir.to_path_buf(),
                exe_dir.join("pdfium"),
                exe_dir.join("lib"),
                exe_dir.join("..").join("lib"),
            ];
            for dir in &candidates {
                let lib_path =
                    Pdfium::pdfium_platform_library_name_at_path(dir.to_string_lossy().as_ref());
                if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                    debug!(dir = %dir.display(), "Loaded PDFium from candidate directory");
                    return Ok(Pdfium::new(bindings));
                }
            }
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        EngineError::Library(format!(
            "PDFium library not found. Set pdfium_library_path, PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

fn map_load_error(path: &Path, e: PdfiumError) -> EngineError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        EngineError::Encrypted
    } else {
        EngineError::Open {
            path: path.to_path_buf(),
            reason: msg,
        }
    }
}

/// Convert PDFium's bottom-left rectangle to a top-left origin box.
fn to_top_left(left: f32, top: f32, right: f32, bottom: f32, page_height: f32) -> BBox {
    BBox::new(
        left.min(right),
        page_height - top.max(bottom),
        left.max(right),
        page_height - top.min(bottom),
    )
}

fn read_page(page: &PdfPage, number: usize) -> Result<PageText, EngineError> {
    let height = page.height().value;
    let text = page.text().map_err(|e| EngineError::Page {
        page: number,
        reason: e.to_string(),
    })?;

    let spans = text
        .segments()
        .iter()
        .filter_map(|segment| {
            let content = segment.text();
            if content.trim().is_empty() {
                return None;
            }
            let bounds = segment.bounds();
            let bbox = to_top_left(
                bounds.left().value,
                bounds.top().value,
                bounds.right().value,
                bounds.bottom().value,
                height,
            );
            Some(TextSpan::new(content, bbox))
        })
        .collect();

    Ok(PageText {
        number,
        width: page.width().value,
        height,
        spans,
    })
}

impl DocumentEngine for PdfiumEngine {
    fn name(&self) -> &'static str {
        "pdfium"
    }

    fn load(&self, path: &Path) -> Result<LoadedDocument, EngineError> {
        let pdfium = load_pdfium(self.library_path.as_deref())?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| map_load_error(path, e))?;

        let pages = document
            .pages()
            .iter()
            .enumerate()
            .map(|(index, page)| read_page(&page, index + 1))
            .collect::<Vec<_>>();

        debug!(file = %path.display(), pages = pages.len(), "Loaded document text");
        Ok(LoadedDocument { pages })
    }
}
