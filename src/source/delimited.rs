//! Delimited text rows (CSV/TSV), UTF-8 with an optional byte-order mark.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use csv::{ReaderBuilder, StringRecord};

use super::{Row, RowCount, SourceError, SourceOptions, build_row};

pub struct DelimitedSource {
    headers: Vec<String>,
    reader: csv::Reader<File>,
    options: SourceOptions,
}

impl DelimitedSource {
    pub fn open(path: &Path, delimiter: u8, options: SourceOptions) -> Result<Self, SourceError> {
        let mut reader = reader_for(path, delimiter)?;

        let headers = match reader.records().next() {
            Some(record) => record_to_strings(&record?),
            None => Vec::new(),
        };
        let headers = strip_bom(headers);

        Ok(Self {
            headers,
            reader,
            options,
        })
    }

    /// Count records after the header. Unreadable files count as unknown.
    pub fn count(path: &Path, delimiter: u8) -> RowCount {
        let Ok(reader) = reader_for(path, delimiter) else {
            return RowCount::Unknown;
        };
        let mut total: u64 = 0;
        for record in reader.into_byte_records() {
            if record.is_err() {
                return RowCount::Unknown;
            }
            total += 1;
        }
        RowCount::Known(total.saturating_sub(1))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn into_rows(self) -> impl Iterator<Item = Result<Row, SourceError>> + Send {
        let headers: Arc<[String]> = self.headers.into();
        let canonical = self.options.canonical;
        self.reader.into_records().map(move |record| {
            let record = record?;
            Ok(build_row(&headers, record_to_strings(&record), &canonical))
        })
    }
}

fn reader_for(path: &Path, delimiter: u8) -> Result<csv::Reader<File>, SourceError> {
    let file = File::open(path)?;
    Ok(ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(file))
}

fn record_to_strings(record: &StringRecord) -> Vec<String> {
    record.iter().map(str::to_string).collect()
}

fn strip_bom(mut headers: Vec<String>) -> Vec<String> {
    if let Some(first) = headers.first_mut()
        && let Some(stripped) = first.strip_prefix('\u{feff}')
    {
        *first = stripped.to_string();
    }
    headers
}
