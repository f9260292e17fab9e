//! JSON-backed document engine and page builders for tests.
//!
//! A fixture file is a serialized `FixtureDocument`: synthetic pages of
//! positioned text plus knobs for failure injection. It lets the whole batch
//! pipeline run without a PDFium binary.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::engine::{DocumentEngine, LoadedDocument};
use super::EngineError;
use crate::models::{BBox, PageText, TextSpan};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDocument {
    pub pages: Vec<PageText>,
    /// 1-based page numbers the engine reports as unreadable.
    #[serde(default)]
    pub unreadable_pages: Vec<usize>,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub panic: bool,
}

/// Reads `FixtureDocument` JSON instead of PDF bytes.
#[derive(Default)]
pub struct FixtureEngine {
    loads: AtomicUsize,
    trip: Option<(usize, Arc<AtomicBool>)>,
}

impl FixtureEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `flag` once `loads` documents have been opened.
    pub fn interrupting_after(loads: usize, flag: Arc<AtomicBool>) -> Self {
        Self {
            loads: AtomicUsize::new(0),
            trip: Some((loads, flag)),
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl DocumentEngine for FixtureEngine {
    fn name(&self) -> &'static str {
        "fixture"
    }

    fn load(&self, path: &Path) -> Result<LoadedDocument, EngineError> {
        let bytes = std::fs::read(path)?;
        let doc: FixtureDocument = serde_json::from_slice(&bytes).map_err(|e| EngineError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let loaded = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, flag)) = &self.trip {
            if loaded >= *after {
                flag.store(true, Ordering::SeqCst);
            }
        }

        if doc.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(doc.delay_ms));
        }
        if doc.panic {
            panic!("fixture engine asked to panic on {}", path.display());
        }

        let pages = doc
            .pages
            .into_iter()
            .map(|page| {
                if doc.unreadable_pages.contains(&page.number) {
                    Err(EngineError::Page {
                        page: page.number,
                        reason: "fixture marks page unreadable".into(),
                    })
                } else {
                    Ok(page)
                }
            })
            .collect();
        Ok(LoadedDocument { pages })
    }
}

pub fn span(text: &str, x0: f32, y0: f32, x1: f32, y1: f32) -> TextSpan {
    TextSpan::new(text, BBox::new(x0, y0, x1, y1))
}

/// A page laid out like a drawing's BOM block.
///
/// Header `PT NO | DESCRIPTION | QTY` at y=100, one row per entry every
/// 12pt, then the `CUT PIPE LENGTH` terminator. A note above the table and a
/// title block far below sit outside the region.
pub fn bom_page(number: usize, rows: &[[&str; 3]]) -> PageText {
    let mut spans = vec![
        span("NOTES: SHOP FABRICATION", 50.0, 30.0, 160.0, 40.0),
        span("PT NO", 50.0, 100.0, 80.0, 110.0),
        span("DESCRIPTION", 100.0, 100.0, 200.0, 110.0),
        span("QTY", 220.0, 100.0, 240.0, 110.0),
    ];
    let mut y = 120.0;
    for [pt, desc, qty] in rows {
        if !pt.is_empty() {
            spans.push(span(pt, 60.0, y, 70.0, y + 10.0));
        }
        if !desc.is_empty() {
            spans.push(span(desc, 120.0, y, 180.0, y + 10.0));
        }
        if !qty.is_empty() {
            spans.push(span(qty, 225.0, y, 235.0, y + 10.0));
        }
        y += 12.0;
    }
    spans.push(span("CUT PIPE LENGTH", 100.0, y + 8.0, 190.0, y + 18.0));
    spans.push(span("DRAWING NO. ISO-0001", 400.0, 700.0, 520.0, 710.0));

    PageText {
        number,
        width: 612.0,
        height: 792.0,
        spans,
    }
}

/// A page with text but no BOM anchor.
pub fn cover_page(number: usize) -> PageText {
    PageText {
        number,
        width: 612.0,
        height: 792.0,
        spans: vec![span("GENERAL ARRANGEMENT", 200.0, 300.0, 400.0, 320.0)],
    }
}

pub fn write_fixture(dir: &Path, name: &str, doc: &FixtureDocument) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec(doc).unwrap()).unwrap();
    path
}

/// One page holding a single BOM row whose part number is `pt`.
pub fn single_row_document(pt: &str) -> FixtureDocument {
    FixtureDocument {
        pages: vec![bom_page(1, &[[pt, "PIPE SMLS", "2"]])],
        ..FixtureDocument::default()
    }
}
