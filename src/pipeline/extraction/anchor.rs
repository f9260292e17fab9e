use serde::Serialize;

use crate::models::{BBox, PageText};

/// Where the anchor label sits on a page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnchorPosition {
    pub bbox: BBox,
    pub page_number: usize,
    /// Share of the matched span taken by the anchor text (1.0 = exact).
    pub confidence: f32,
    /// Index of the matched span in `PageText::spans`.
    pub span_index: usize,
}

/// First span, in document order, containing `anchor_text` (case-insensitive).
pub fn find_anchor(page: &PageText, anchor_text: &str) -> Option<AnchorPosition> {
    let needle = anchor_text.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let needle_len = needle.chars().count() as f32;

    page.spans.iter().enumerate().find_map(|(index, span)| {
        let haystack = span.text.trim().to_lowercase();
        if !haystack.contains(&needle) {
            return None;
        }
        Some(AnchorPosition {
            bbox: span.bbox,
            page_number: page.number,
            confidence: (needle_len / haystack.chars().count() as f32).min(1.0),
            span_index: index,
        })
    })
}
