//! Bulk dispatch: the per-row engine, its output log, and run observers.

pub mod engine;
pub mod log;
pub mod observer;

pub use engine::{Dispatcher, RunInput, RunSummary, StopReason, Templates};
pub use log::{LogRecord, LogWriter, RowOutcome};
pub use observer::{CapDecision, DispatchObserver, TracingObserver};
