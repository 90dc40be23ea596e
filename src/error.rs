//! Error types for bulksend.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for a dispatch run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Row source error: {0}")]
    Source(#[from] SourceError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Output log error: {0}")]
    Output(#[from] OutputError),
}

/// Configuration-related errors. Raised before any row is processed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read template {path}: {source}")]
    TemplateUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Account not found: {0}")]
    UnknownAccount(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Row source errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Input file not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("Delimited text error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("Spreadsheet {0} has no worksheets")]
    EmptyWorkbook(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// History store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Delivery transport errors. Inside a run these become failed attempts.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Invalid message for {name}: {reason}")]
    InvalidMessage { name: String, reason: String },

    #[error("Failed to send on {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Send on {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Output log errors.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Failed to create output log {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write output log: {0}")]
    Write(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bulksend.
pub type Result<T> = std::result::Result<T, Error>;
