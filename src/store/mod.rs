//! Persistence layer: libSQL-backed send history and account registry.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlHistory;
pub use traits::{Account, HistoryGate, NoHistory, SendRecord, SendStatus};
