//! Output log: one CSV row per processed input row.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::OutputError;
use crate::source::Row;

/// Per-row outcome tag, written to the `outcome` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// Already delivered today; not attempted.
    Duplicate,
    /// Recipient column empty or missing.
    NoRecipient,
    DryRun,
    Sent,
    Failed,
}

impl RowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::NoRecipient => "no_recipient",
            Self::DryRun => "dry_run",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RowOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output log row. Written once, never updated.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub row: Row,
    pub recipient: String,
    pub subject: Option<String>,
    pub message: String,
    pub attempts: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response: String,
    pub sent_at: DateTime<Utc>,
    pub outcome: RowOutcome,
}

/// Columns appended after the input headers.
const TRAILING_COLUMNS: [&str; 7] = [
    "message",
    "attempts",
    "success",
    "status_code",
    "response",
    "sent_at",
    "outcome",
];

pub struct LogWriter<W: Write> {
    writer: csv::Writer<W>,
    headers: Vec<String>,
    include_subject: bool,
    path: Option<PathBuf>,
    written: usize,
}

impl LogWriter<File> {
    /// Create (or truncate) the log file and write its header.
    pub fn create(
        path: &Path,
        headers: &[String],
        include_subject: bool,
    ) -> Result<Self, OutputError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| OutputError::Create {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| OutputError::Create {
            path: path.to_path_buf(),
            source,
        })?;

        let mut log = Self::from_writer(file, headers, include_subject)?;
        log.path = Some(path.to_path_buf());
        Ok(log)
    }
}

impl<W: Write> LogWriter<W> {
    pub fn from_writer(
        inner: W,
        headers: &[String],
        include_subject: bool,
    ) -> Result<Self, OutputError> {
        let mut writer = csv::WriterBuilder::new().flexible(false).from_writer(inner);

        let mut header: Vec<&str> = headers.iter().map(String::as_str).collect();
        header.push("recipient_normalized");
        if include_subject {
            header.push("subject");
        }
        header.extend(TRAILING_COLUMNS);
        writer.write_record(&header)?;

        Ok(Self {
            writer,
            headers: headers.to_vec(),
            include_subject,
            path: None,
            written: 0,
        })
    }

    pub fn write(&mut self, record: &LogRecord) -> Result<(), OutputError> {
        let mut fields: Vec<String> = self
            .headers
            .iter()
            .map(|h| record.row.get(h).unwrap_or_default().to_string())
            .collect();

        fields.push(record.recipient.clone());
        if self.include_subject {
            fields.push(record.subject.clone().unwrap_or_default());
        }
        fields.push(record.message.clone());
        fields.push(record.attempts.to_string());
        fields.push(record.success.to_string());
        fields.push(record.status_code.map(|c| c.to_string()).unwrap_or_default());
        fields.push(record.response.clone());
        fields.push(record.sent_at.to_rfc3339_opts(SecondsFormat::Secs, true));
        fields.push(record.outcome.to_string());

        self.writer.write_record(&fields)?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Records written so far, header excluded.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn into_inner(self) -> Result<W, OutputError> {
        self.writer
            .into_inner()
            .map_err(|e| OutputError::Io(e.into_error()))
    }
}
