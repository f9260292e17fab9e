//! Page geometry: boxes and positioned text.
//!
//! All coordinates are PDF points with a top-left origin: `y0` is the top
//! edge, `y1` the bottom edge, and y grows downward the page.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn center_x(&self) -> f32 {
        (self.x0 + self.x1) * 0.5
    }

    pub fn center_y(&self) -> f32 {
        (self.y0 + self.y1) * 0.5
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// True when the two boxes share some vertical extent.
    pub fn overlaps_vertically(&self, other: &Self) -> bool {
        self.y0 < other.y1 && other.y0 < self.y1
    }

    /// True when `other` lies entirely inside this box (edges inclusive).
    pub fn contains(&self, other: &Self) -> bool {
        other.x0 >= self.x0 && other.x1 <= self.x1 && other.y0 >= self.y0 && other.y1 <= self.y1
    }
}

/// A unit of positioned text emitted by the document engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    pub text: String,
    pub bbox: BBox,
}

impl TextSpan {
    pub fn new(text: impl Into<String>, bbox: BBox) -> Self {
        Self {
            text: text.into(),
            bbox,
        }
    }

    /// Rendered width per character, or `None` for blank spans.
    pub fn char_width(&self) -> Option<f32> {
        let count = self.text.trim().chars().count();
        if count == 0 {
            None
        } else {
            Some(self.bbox.width() / count as f32)
        }
    }
}

/// Positioned text of one page, spans kept in document emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageText {
    /// 1-based page number.
    pub number: usize,
    pub width: f32,
    pub height: f32,
    pub spans: Vec<TextSpan>,
}
