//! Table region inference.
//!
//! Drawings carry no grid lines around the BOM, so the region is derived
//! from text alone: the anchor label and its header neighbours give the top
//! edge and width, a terminator label gives the bottom edge, and the average
//! character width of known labels sets the padding. The padded estimate is
//! then tightened to the spans that actually fall inside it.

use serde::Serialize;
use thiserror::Error;

use super::anchor::AnchorPosition;
use crate::config::LayoutSettings;
use crate::models::{BBox, ErrorCode, PageText, TextSpan};

/// Vertical tolerance for header candidates, as a share of the anchor height.
const HEADER_TOLERANCE_RATIO: f32 = 0.2;
/// Padding, in average character widths.
const PAD_CHARS: f32 = 2.0;
/// Padding above the header, in anchor heights.
const PAD_HEADER_HEIGHTS: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TableBoundary {
    pub top: f32,
    pub left: f32,
    pub right: f32,
    pub bottom: f32,
}

impl TableBoundary {
    pub fn from_bbox(bbox: &BBox) -> Self {
        Self {
            top: bbox.y0,
            left: bbox.x0,
            right: bbox.x1,
            bottom: bbox.y1,
        }
    }

    /// `top < bottom` and `left < right`. NaN edges are never valid.
    pub fn is_valid(&self) -> bool {
        self.top < self.bottom && self.left < self.right
    }

    pub fn contains(&self, bbox: &BBox) -> bool {
        bbox.x0 >= self.left && bbox.x1 <= self.right && bbox.y0 >= self.top && bbox.y1 <= self.bottom
    }

    pub fn padded(&self, by: f32) -> Self {
        Self {
            top: self.top - by,
            left: self.left - by,
            right: self.right + by,
            bottom: self.bottom + by,
        }
    }

    fn checked(self) -> Result<Self, BoundaryError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(BoundaryError::InvalidTableBoundary(self))
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoundaryError {
    #[error("No header keyword ({expected}) next to the anchor")]
    HeaderNotRecognized { expected: String },

    #[error("Terminator \"{terminator}\" not found below \"{secondary}\"")]
    TerminatorNotFound { terminator: String, secondary: String },

    #[error("No text inside the estimated table region")]
    EmptyTableRegion,

    #[error("Degenerate table boundary {0:?}")]
    InvalidTableBoundary(TableBoundary),
}

impl BoundaryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::HeaderNotRecognized { .. } => ErrorCode::HeaderNotRecognized,
            Self::TerminatorNotFound { .. } => ErrorCode::TerminatorNotFound,
            Self::EmptyTableRegion => ErrorCode::EmptyTableRegion,
            Self::InvalidTableBoundary(_) => ErrorCode::InvalidTableBoundary,
        }
    }
}

/// A resolved region and the spans inside it, in document order.
#[derive(Debug, Clone)]
pub struct ResolvedTable {
    pub boundary: TableBoundary,
    pub spans: Vec<TextSpan>,
    pub avg_char_width: f32,
}

fn normalized(text: &str) -> String {
    text.trim().to_lowercase()
}

pub fn resolve_boundary(
    page: &PageText,
    anchor: &AnchorPosition,
    layout: &LayoutSettings,
) -> Result<ResolvedTable, BoundaryError> {
    let anchor_box = anchor.bbox;
    let anchor_span = page.spans.get(anchor.span_index);
    let height = anchor_box.height();
    let middle = anchor_box.center_y();
    let tolerance = HEADER_TOLERANCE_RATIO * height;

    // 1. Header candidates to the right of the anchor, on its line.
    let candidates: Vec<&TextSpan> = page
        .spans
        .iter()
        .filter(|s| s.bbox.x0 >= anchor_box.x1)
        .filter(|s| {
            (s.bbox.center_y() - middle).abs() <= tolerance || s.bbox.overlaps_vertically(&anchor_box)
        })
        .collect();

    // 2. The header line must carry at least one known keyword.
    let keywords: Vec<String> = layout.header_keywords.iter().map(|k| normalized(k)).collect();
    let header_texts: Vec<String> = anchor_span
        .into_iter()
        .chain(candidates.iter().copied())
        .map(|s| normalized(&s.text))
        .collect();
    let recognized = keywords.is_empty()
        || keywords
            .iter()
            .any(|k| header_texts.iter().any(|t| t.contains(k.as_str())));
    if !recognized {
        return Err(BoundaryError::HeaderNotRecognized {
            expected: layout.header_keywords.join(", "),
        });
    }

    // 3. Header box.
    let header = candidates
        .iter()
        .fold(anchor_box, |acc, s| acc.union(&s.bbox));
    let header_top = header.y0;
    let header_left = anchor_box.x0;
    let header_right = header.x1;

    // 4. Terminator below the secondary header token.
    let secondary_text = normalized(&layout.secondary_header);
    let secondary = page
        .spans
        .iter()
        .find(|s| normalized(&s.text) == secondary_text)
        .map(|s| s.bbox)
        .unwrap_or(anchor_box);
    let terminator_text = normalized(&layout.terminator);
    let terminator = page
        .spans
        .iter()
        .find(|s| {
            normalized(&s.text) == terminator_text
                && s.bbox.y0 >= secondary.y1
                && s.bbox.x0 >= secondary.x0
        })
        .ok_or_else(|| BoundaryError::TerminatorNotFound {
            terminator: layout.terminator.clone(),
            secondary: layout.secondary_header.clone(),
        })?;

    // 5. Average character width from the width labels.
    let labels: Vec<String> = layout.width_labels.iter().map(|l| normalized(l)).collect();
    let avg_char_width = page
        .spans
        .iter()
        .filter(|s| labels.contains(&normalized(&s.text)))
        .filter_map(TextSpan::char_width)
        .fold(None, |best: Option<f32>, w| Some(best.map_or(w, |b| b.max(w))))
        .or_else(|| anchor_span.and_then(TextSpan::char_width))
        .unwrap_or(0.0);
    let pad = PAD_CHARS * avg_char_width;

    // 6. Padded estimate.
    let estimate = TableBoundary {
        top: header_top - PAD_HEADER_HEIGHTS * height,
        left: header_left - pad,
        right: header_right + pad,
        bottom: terminator.bbox.y1 + pad,
    }
    .checked()?;

    // 7. Tighten to the contained spans, then pad again.
    let spans: Vec<TextSpan> = page
        .spans
        .iter()
        .filter(|s| estimate.contains(&s.bbox))
        .cloned()
        .collect();
    let tight = spans
        .iter()
        .map(|s| s.bbox)
        .reduce(|acc, b| acc.union(&b))
        .ok_or(BoundaryError::EmptyTableRegion)?;
    let boundary = TableBoundary::from_bbox(&tight).padded(pad).checked()?;

    tracing::debug!(
        page = page.number,
        spans = spans.len(),
        top = boundary.top,
        bottom = boundary.bottom,
        "Resolved table boundary"
    );

    Ok(ResolvedTable {
        boundary,
        spans,
        avg_char_width,
    })
}
