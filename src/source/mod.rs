//! Row source: recipient rows from delimited text or spreadsheets.
//!
//! Both formats share one padding + canonicalization path ([`build_row`]),
//! so a row looks the same regardless of where it came from:
//! - short physical rows are right-padded with empty strings to the header
//!   length
//! - canonical fields (`phone`, `email`, `first_name`, ...) missing from the
//!   header are filled from their positional column, never overwriting a key
//!   that is already present

pub mod delimited;
pub mod spreadsheet;

use std::path::Path;

use crate::config::ChannelKind;
use crate::error::SourceError;

pub use delimited::DelimitedSource;
pub use spreadsheet::SpreadsheetSource;

/// Lazy, single-pass iterator over canonicalized rows.
pub type Rows = Box<dyn Iterator<Item = Result<Row, SourceError>> + Send>;

/// One recipient row: ordered, case-preserving column name → value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    fields: Vec<(String, String)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for an exact key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value for a key, matching case-insensitively. Exact matches win.
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        self.get(key).or_else(|| {
            let wanted = key.to_lowercase();
            self.fields
                .iter()
                .find(|(k, _)| k.to_lowercase() == wanted)
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    /// Insert or replace a value. A replaced key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Insert only if the key is absent. Returns whether it was inserted.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains_key(&key) {
            return false;
        }
        self.fields.push((key, value.into()));
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

/// Best-effort data row count (header excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCount {
    Known(u64),
    /// The file could not be counted cheaply; show indeterminate progress.
    Unknown,
}

impl std::fmt::Display for RowCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(n) => write!(f, "{n}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// How physical rows are turned into [`Row`]s.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    /// `(name, column index)` pairs filled positionally when absent.
    pub canonical: Vec<(String, usize)>,
}

impl SourceOptions {
    pub fn for_channel(channel: ChannelKind) -> Self {
        Self {
            canonical: channel
                .canonical_fields()
                .iter()
                .map(|(name, idx)| (name.to_string(), *idx))
                .collect(),
        }
    }
}

/// Supported on-disk formats, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Delimited { delimiter: u8 },
    Spreadsheet,
}

impl SourceFormat {
    pub fn detect(path: &Path) -> Result<Self, SourceError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "csv" | "txt" => Ok(Self::Delimited { delimiter: b',' }),
            "tsv" => Ok(Self::Delimited { delimiter: b'\t' }),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Ok(Self::Spreadsheet),
            "" => Err(SourceError::UnsupportedFormat(format!(
                "{} (no file extension)",
                path.display()
            ))),
            other => Err(SourceError::UnsupportedFormat(format!(".{other}"))),
        }
    }
}

/// A tabular recipient file, opened and positioned after its header.
pub enum RowSource {
    Delimited(DelimitedSource),
    Spreadsheet(SpreadsheetSource),
}

impl RowSource {
    /// Open a file and read its header.
    pub fn open(path: &Path, options: SourceOptions) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::NotFound(path.to_path_buf()));
        }
        let source = match SourceFormat::detect(path)? {
            SourceFormat::Delimited { delimiter } => {
                Self::Delimited(DelimitedSource::open(path, delimiter, options)?)
            }
            SourceFormat::Spreadsheet => {
                Self::Spreadsheet(SpreadsheetSource::open(path, options)?)
            }
        };
        tracing::debug!(
            path = %path.display(),
            columns = source.headers().len(),
            "Row source opened"
        );
        Ok(source)
    }

    /// Count data rows without yielding them. Never fails.
    pub fn count(path: &Path) -> RowCount {
        match SourceFormat::detect(path) {
            Ok(SourceFormat::Delimited { delimiter }) => DelimitedSource::count(path, delimiter),
            Ok(SourceFormat::Spreadsheet) => SpreadsheetSource::count(path),
            Err(_) => RowCount::Unknown,
        }
    }

    /// Header names in file order.
    pub fn headers(&self) -> &[String] {
        match self {
            Self::Delimited(s) => s.headers(),
            Self::Spreadsheet(s) => s.headers(),
        }
    }

    /// Consume the source, yielding rows starting at the 1-based `start_row`.
    /// Earlier rows are read and discarded.
    pub fn rows_from(self, start_row: usize) -> Rows {
        let skip = start_row.saturating_sub(1);
        match self {
            Self::Delimited(s) => Box::new(s.into_rows().skip(skip)),
            Self::Spreadsheet(s) => Box::new(s.into_rows().skip(skip)),
        }
    }
}

/// Build a row from a header and one physical record.
pub fn build_row(headers: &[String], mut raw: Vec<String>, canonical: &[(String, usize)]) -> Row {
    if raw.len() < headers.len() {
        raw.resize(headers.len(), String::new());
    }

    let mut row: Row = headers
        .iter()
        .zip(raw.iter())
        .map(|(h, v)| (h.clone(), v.clone()))
        .collect();

    for (name, idx) in canonical {
        let wanted = name.to_lowercase();
        let in_header = headers.iter().any(|h| h.to_lowercase() == wanted);
        if in_header {
            continue;
        }
        if let Some(value) = raw.get(*idx) {
            row.insert_if_absent(name.clone(), value.clone());
        }
    }

    row
}
