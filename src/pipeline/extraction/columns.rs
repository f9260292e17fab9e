use regex::Regex;
use serde::Serialize;

use super::rows::row_text;
use crate::config::LayoutSettings;
use crate::models::TextSpan;

/// Default horizontal tolerance (points) between a cell and its column.
pub const DEFAULT_COLUMN_TOLERANCE: f32 = 15.0;

/// Cells farther than this many tolerances from every column are dropped.
const DROP_FACTOR: f32 = 3.0;

/// Header names and the data rows mapped onto them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappedTable {
    pub headers: Vec<String>,
    /// One value per header, in header order.
    pub rows: Vec<Vec<String>>,
    pub unmatched_cells: usize,
}

/// Column assignment knobs, compiled once per pipeline.
#[derive(Debug, Clone)]
pub struct ColumnRules {
    pub tolerance_x: f32,
    pub noise_leading_columns: usize,
    termination: Vec<Regex>,
}

impl ColumnRules {
    pub fn new(
        tolerance_x: f32,
        noise_leading_columns: usize,
        termination_keywords: &[String],
    ) -> Result<Self, regex::Error> {
        let termination = termination_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|k| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(k))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            tolerance_x,
            noise_leading_columns,
            termination,
        })
    }

    pub fn from_layout(layout: &LayoutSettings) -> Result<Self, regex::Error> {
        Self::new(
            layout.column_tolerance_x,
            layout.noise_leading_columns,
            &layout.termination_keywords,
        )
    }

    fn terminates(&self, text: &str) -> bool {
        self.termination.iter().any(|re| re.is_match(text))
    }
}

fn nearest_column(centers: &[f32], x: f32) -> Option<(usize, f32)> {
    centers
        .iter()
        .enumerate()
        .map(|(i, c)| (i, (c - x).abs()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Map grouped rows onto the columns defined by `header_row`.
///
/// Stops before the first row that mentions a termination keyword and skips
/// rows whose leading columns are all empty.
pub fn map_columns(header_row: &[TextSpan], data_rows: &[Vec<TextSpan>], rules: &ColumnRules) -> MappedTable {
    let mut header_spans: Vec<&TextSpan> = header_row.iter().collect();
    header_spans.sort_by(|a, b| a.bbox.center_x().total_cmp(&b.bbox.center_x()));
    let headers: Vec<String> = header_spans.iter().map(|s| s.text.trim().to_string()).collect();
    let centers: Vec<f32> = header_spans.iter().map(|s| s.bbox.center_x()).collect();
    let max_distance = DROP_FACTOR * rules.tolerance_x;

    let mut table = MappedTable {
        headers,
        ..MappedTable::default()
    };

    for row in data_rows {
        if rules.terminates(&row_text(row)) {
            break;
        }

        let mut values = vec![String::new(); centers.len()];
        let mut cells: Vec<&TextSpan> = row.iter().collect();
        cells.sort_by(|a, b| a.bbox.center_x().total_cmp(&b.bbox.center_x()));
        for cell in cells {
            let text = cell.text.trim();
            if text.is_empty() {
                continue;
            }
            match nearest_column(&centers, cell.bbox.center_x()) {
                Some((column, distance)) if distance < max_distance => {
                    let value = &mut values[column];
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(text);
                }
                _ => table.unmatched_cells += 1,
            }
        }

        let all_empty = values.iter().all(String::is_empty);
        let leading_empty = rules.noise_leading_columns > 0
            && values
                .iter()
                .take(rules.noise_leading_columns)
                .all(String::is_empty);
        if all_empty || leading_empty {
            continue;
        }
        table.rows.push(values);
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BBox;
    use crate::pipeline::extraction::fixtures::span;
    use proptest::prelude::*;

    fn default_rules() -> ColumnRules {
        ColumnRules::from_layout(&LayoutSettings::default()).unwrap()
    }

    fn header() -> Vec<TextSpan> {
        vec![
            span("QTY", 220.0, 100.0, 240.0, 110.0),
            span("PT NO", 50.0, 100.0, 80.0, 110.0),
            span("DESCRIPTION", 100.0, 100.0, 200.0, 110.0),
        ]
    }

    fn row(cells: &[(&str, f32)], y: f32) -> Vec<TextSpan> {
        cells
            .iter()
            .map(|(text, cx)| span(text, cx - 5.0, y, cx + 5.0, y + 10.0))
            .collect()
    }

    #[test]
    fn headers_follow_horizontal_order() {
        let table = map_columns(&header(), &[], &default_rules());
        assert_eq!(table.headers, vec!["PT NO", "DESCRIPTION", "QTY"]);
        assert!(table.rows.is_empty());
    }

    #[test]
    fn cells_map_to_nearest_header() {
        let rows = vec![row(&[("1", 66.0), ("PIPE", 148.0), ("2", 229.0)], 120.0)];
        let table = map_columns(&header(), &rows, &default_rules());
        assert_eq!(table.rows, vec![vec!["1", "PIPE", "2"]]);
        assert_eq!(table.unmatched_cells, 0);
    }

    #[test]
    fn same_column_cells_are_joined_left_to_right() {
        let rows = vec![row(&[("1", 65.0), ("SCH 40", 160.0), ("PIPE", 135.0)], 120.0)];
        let table = map_columns(&header(), &rows, &default_rules());
        assert_eq!(table.rows[0][1], "PIPE SCH 40");
    }

    #[test]
    fn far_cells_are_dropped_and_counted() {
        let rows = vec![row(&[("1", 65.0), ("PIPE", 150.0), ("STRAY", 400.0)], 120.0)];
        let table = map_columns(&header(), &rows, &default_rules());
        assert_eq!(table.unmatched_cells, 1);
        assert_eq!(table.rows[0], vec!["1", "PIPE", ""]);
    }

    #[test]
    fn termination_keyword_stops_consumption() {
        let rows = vec![
            row(&[("1", 65.0), ("PIPE", 150.0)], 120.0),
            row(&[("Total", 150.0)], 132.0),
            row(&[("2", 65.0), ("FLANGE", 150.0)], 144.0),
        ];
        let table = map_columns(&header(), &rows, &default_rules());
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn keyword_inside_a_word_does_not_terminate() {
        let rows = vec![
            row(&[("1", 65.0), ("SUBTOTALS PIPE", 150.0)], 120.0),
            row(&[("2", 65.0), ("FLANGE", 150.0)], 132.0),
        ];
        let table = map_columns(&header(), &rows, &default_rules());
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn rows_with_empty_leading_columns_are_noise() {
        let rows = vec![
            row(&[("4", 230.0)], 120.0),
            row(&[("", 65.0), ("GASKET", 150.0)], 132.0),
        ];
        let table = map_columns(&header(), &rows, &default_rules());
        assert_eq!(table.rows, vec![vec!["", "GASKET", ""]]);
    }

    #[test]
    fn noise_filter_disabled_keeps_partial_rows() {
        let rules = ColumnRules::new(15.0, 0, &["TOTAL".into()]).unwrap();
        let rows = vec![row(&[("4", 230.0)], 120.0)];
        let table = map_columns(&header(), &rows, &rules);
        assert_eq!(table.rows, vec![vec!["", "", "4"]]);
    }

    proptest! {
        #[test]
        fn evenly_spaced_columns_round_trip(
            n in 1usize..8,
            spacing in 20.0f32..120.0,
            ratio in 0.01f32..0.49,
        ) {
            let tolerance = spacing * ratio;
            let header: Vec<TextSpan> = (0..n)
                .map(|i| {
                    let cx = 100.0 + i as f32 * spacing;
                    TextSpan::new(format!("H{i}"), BBox::new(cx - 4.0, 0.0, cx + 4.0, 10.0))
                })
                .collect();
            let cells: Vec<TextSpan> = header
                .iter()
                .enumerate()
                .map(|(i, h)| TextSpan::new(format!("v{i}"), BBox::new(h.bbox.x0, 20.0, h.bbox.x1, 30.0)))
                .collect();
            let rules = ColumnRules::new(tolerance, 0, &[]).unwrap();
            let table = map_columns(&header, &[cells], &rules);
            let expected: Vec<String> = (0..n).map(|i| format!("v{i}")).collect();
            prop_assert_eq!(table.rows, vec![expected]);
            prop_assert_eq!(table.unmatched_cells, 0);
        }
    }
}
