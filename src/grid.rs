use serde::{Deserialize, Serialize};

/// Zero-based index of the default status column (C) when no header says "status".
pub const DEFAULT_STATUS_COLUMN: usize = 2;

/// A block of cells as returned by `values.get`
///
/// Rows are ragged: the API omits trailing empty cells, so any cell past
/// the end of its row reads as the empty string.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub rows: Vec<Vec<String>>,
}

/// A single matched cell with its header context
#[derive(Clone, Debug, PartialEq)]
pub struct CellMatch {
    pub row: usize,
    pub col: usize,
    pub value: String,
    pub row_header: String,
    pub column_header: String,
}

impl CellMatch {
    /// A1-style coordinate of the match, e.g. `C7`
    pub fn coordinate(&self) -> String {
        format!("{}{}", column_letter(self.col), self.row + 1)
    }
}

/// Convert a zero-based column index to its letter name
///
/// # Arguments
/// * `index` - Zero-based column index (0 is `A`, 25 is `Z`, 26 is `AA`)
///
/// # Returns
/// * `String` - The column letters
pub fn column_letter(index: usize) -> String {
    let mut col = index + 1;
    let mut result = Vec::new();
    while col > 0 {
        col -= 1;
        result.push((col % 26) as u8 + b'A');
        col /= 26;
    }
    result.reverse();
    String::from_utf8_lossy(&result).into_owned()
}

impl Grid {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Grid { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell text, or the empty string when the cell is absent
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn headers(&self) -> &[String] {
        self.rows.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// First row (header row included) whose column A contains `needle`
    ///
    /// Matching is case-insensitive substring matching.
    pub fn find_row_containing(&self, needle: &str) -> Option<usize> {
        let needle = needle.to_lowercase();
        (0..self.rows.len()).find(|&r| {
            let key = self.cell(r, 0);
            !key.is_empty() && key.to_lowercase().contains(&needle)
        })
    }

    /// First data row whose trimmed column A equals `needle`, ignoring case
    pub fn find_row_exact(&self, needle: &str) -> Option<usize> {
        let needle = needle.trim().to_lowercase();
        (1..self.rows.len()).find(|&r| {
            let key = self.cell(r, 0).trim();
            !key.is_empty() && key.to_lowercase() == needle
        })
    }

    /// First header cell containing `needle`, ignoring case
    pub fn find_header_containing(&self, needle: &str) -> Option<usize> {
        let needle = needle.to_lowercase();
        self.headers()
            .iter()
            .position(|h| !h.is_empty() && h.to_lowercase().contains(&needle))
    }

    /// First header cell equal to `needle` after trimming, ignoring case
    pub fn find_header_exact(&self, needle: &str) -> Option<usize> {
        let needle = needle.trim().to_lowercase();
        self.headers()
            .iter()
            .position(|h| !h.trim().is_empty() && h.trim().to_lowercase() == needle)
    }

    /// Locate the cell at the intersection of a row key and a column header
    ///
    /// The row is the first whose column A contains `row_value`, the column
    /// is the first header containing `column_value`.
    ///
    /// # Returns
    /// * `Result<CellMatch, SearchMiss>` - The cell, or which axis failed to match
    pub fn search(&self, row_value: &str, column_value: &str) -> Result<CellMatch, SearchMiss> {
        let row = self
            .find_row_containing(row_value)
            .ok_or(SearchMiss::Row)?;
        let col = self
            .find_header_containing(column_value)
            .ok_or(SearchMiss::Column)?;

        Ok(CellMatch {
            row,
            col,
            value: self.cell(row, col).to_string(),
            row_header: self.cell(row, 0).to_string(),
            column_header: self.cell(0, col).to_string(),
        })
    }

    /// Index of the column that tracks whether a row was handed out
    pub fn status_column(&self) -> usize {
        self.find_header_containing("status")
            .unwrap_or(DEFAULT_STATUS_COLUMN)
    }

    /// Non-blank cells below the header in column `col`, top to bottom
    pub fn column_values(&self, col: usize) -> Vec<String> {
        (1..self.rows.len())
            .map(|r| self.cell(r, col))
            .filter(|v| !v.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Up to `limit` non-blank header names, for "column not found" replies
    pub fn non_empty_headers(&self, limit: usize) -> Vec<String> {
        self.headers()
            .iter()
            .filter(|h| !h.trim().is_empty())
            .take(limit)
            .cloned()
            .collect()
    }

    /// Up to `limit` non-blank column A values below the header
    pub fn row_keys(&self, limit: usize) -> Vec<String> {
        (1..self.rows.len())
            .map(|r| self.cell(r, 0))
            .filter(|v| !v.is_empty())
            .take(limit)
            .map(str::to_string)
            .collect()
    }
}

/// Which half of a coordinate search found nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMiss {
    Row,
    Column,
}

/// Whether a status cell marks its row as already handed out
pub fn is_used(status: &str) -> bool {
    status.trim().eq_ignore_ascii_case("used")
}
