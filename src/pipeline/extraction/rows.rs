use crate::models::TextSpan;

/// Default vertical tolerance (points) for spans on the same row.
pub const DEFAULT_ROW_TOLERANCE: f32 = 3.0;

struct RowBucket<'a> {
    center_sum: f32,
    spans: Vec<&'a TextSpan>,
}

impl<'a> RowBucket<'a> {
    fn new(span: &'a TextSpan) -> Self {
        Self {
            center_sum: span.bbox.center_y(),
            spans: vec![span],
        }
    }

    fn mean(&self) -> f32 {
        self.center_sum / self.spans.len() as f32
    }

    fn push(&mut self, span: &'a TextSpan) {
        self.center_sum += span.bbox.center_y();
        self.spans.push(span);
    }
}

/// Cluster spans into visual rows.
///
/// Spans are visited top to bottom; each joins the first row whose running
/// mean center lies within `tolerance_y`, otherwise it opens a new row.
/// Rows come back top to bottom, spans within a row left to right.
pub fn group_rows(spans: &[TextSpan], tolerance_y: f32) -> Vec<Vec<TextSpan>> {
    let mut ordered: Vec<&TextSpan> = spans.iter().collect();
    ordered.sort_by(|a, b| a.bbox.center_y().total_cmp(&b.bbox.center_y()));

    let mut buckets: Vec<RowBucket<'_>> = Vec::new();
    for span in ordered {
        let center = span.bbox.center_y();
        match buckets
            .iter_mut()
            .find(|b| (b.mean() - center).abs() <= tolerance_y)
        {
            Some(bucket) => bucket.push(span),
            None => buckets.push(RowBucket::new(span)),
        }
    }

    buckets.sort_by(|a, b| a.mean().total_cmp(&b.mean()));
    buckets
        .into_iter()
        .map(|bucket| {
            let mut row: Vec<TextSpan> = bucket.spans.into_iter().cloned().collect();
            row.sort_by(|a, b| a.bbox.center_x().total_cmp(&b.bbox.center_x()));
            row
        })
        .collect()
}

/// Plain text of a row, spans joined by single spaces.
pub fn row_text(row: &[TextSpan]) -> String {
    row.iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
