//! Spreadsheet rows (xlsx/xls/ods) via calamine. Row 1 of the first
//! worksheet is the header; cells are addressed from A1.

use std::path::Path;
use std::sync::Arc;

use calamine::{Data, Range, Reader, open_workbook_auto};

use super::{Row, RowCount, SourceError, SourceOptions, build_row};

pub struct SpreadsheetSource {
    headers: Vec<String>,
    range: Range<Data>,
    options: SourceOptions,
}

impl SpreadsheetSource {
    pub fn open(path: &Path, options: SourceOptions) -> Result<Self, SourceError> {
        Ok(Self::from_range(first_sheet(path)?, options))
    }

    fn from_range(range: Range<Data>, options: SourceOptions) -> Self {
        let (height, width) = extent(&range);
        let headers = if height == 0 {
            Vec::new()
        } else {
            (0..width).map(|col| cell_at(&range, 0, col)).collect()
        };

        Self {
            headers,
            range,
            options,
        }
    }

    /// Data rows in the first sheet, or unknown if the workbook is malformed.
    pub fn count(path: &Path) -> RowCount {
        match first_sheet(path) {
            Ok(range) => RowCount::Known(extent(&range).0.saturating_sub(1) as u64),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Spreadsheet row count unavailable");
                RowCount::Unknown
            }
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn into_rows(self) -> impl Iterator<Item = Result<Row, SourceError>> + Send {
        let headers: Arc<[String]> = self.headers.into();
        let canonical = self.options.canonical;
        let range = self.range;
        let (height, width) = extent(&range);

        (1..height).map(move |r| {
            let raw: Vec<String> = (0..width).map(|c| cell_at(&range, r, c)).collect();
            Ok(build_row(&headers, trim_trailing_empty(raw), &canonical))
        })
    }
}

fn first_sheet(path: &Path) -> Result<Range<Data>, SourceError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| SourceError::Spreadsheet(e.to_string()))?;
    workbook
        .worksheet_range_at(0)
        .ok_or_else(|| SourceError::EmptyWorkbook(path.to_path_buf()))?
        .map_err(|e| SourceError::Spreadsheet(e.to_string()))
}

/// Sheet size counted from A1. calamine trims leading blank rows and columns
/// from a range, so everything here is addressed absolutely.
fn extent(range: &Range<Data>) -> (u32, u32) {
    range
        .end()
        .map(|(row, col)| (row + 1, col + 1))
        .unwrap_or((0, 0))
}

/// Cell at an absolute `(row, col)`; blank outside the used range.
fn cell_at(range: &Range<Data>, row: u32, col: u32) -> String {
    range
        .get_value((row, col))
        .map(cell_to_string)
        .unwrap_or_default()
}

/// Trailing blank cells are not part of the physical row; padding restores
/// them up to the header width.
fn trim_trailing_empty(mut raw: Vec<String>) -> Vec<String> {
    while raw.last().is_some_and(|v| v.is_empty()) {
        raw.pop();
    }
    raw
}

/// Render a cell the way a user would read it in the sheet.
pub fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => format_float(*f),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_else(|| format_float(dt.as_f64())),
    }
}

/// Whole numbers (phone numbers typed into numeric cells) lose the `.0`.
fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}
