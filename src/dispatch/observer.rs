//! Run observer: progress notifications and the daily-cap decision.

use async_trait::async_trait;

use super::engine::RunSummary;
use crate::source::RowCount;

/// Answer to "the daily cap has been reached, keep going?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapDecision {
    Continue,
    Stop,
}

/// Receives run events. All methods have no-op defaults except the cap
/// question, which stops the run unless overridden.
#[async_trait]
pub trait DispatchObserver: Send + Sync {
    fn on_start(&self, _total: RowCount) {}

    fn on_progress(&self, _message: &str, _processed: usize) {}

    /// Asked at most once per run.
    async fn on_daily_cap(&self, _sent_today: u64, _cap: u64) -> CapDecision {
        CapDecision::Stop
    }

    fn on_complete(&self, _summary: &RunSummary) {}
}

/// Reports run events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver {
    /// Answer to the daily-cap question.
    pub continue_past_cap: bool,
}

#[async_trait]
impl DispatchObserver for TracingObserver {
    fn on_start(&self, total: RowCount) {
        tracing::info!(%total, "Dispatch started");
    }

    fn on_progress(&self, message: &str, processed: usize) {
        tracing::info!(processed, "{message}");
    }

    async fn on_daily_cap(&self, sent_today: u64, cap: u64) -> CapDecision {
        if self.continue_past_cap {
            tracing::warn!(sent_today, cap, "Daily cap reached, continuing");
            CapDecision::Continue
        } else {
            tracing::warn!(sent_today, cap, "Daily cap reached, stopping");
            CapDecision::Stop
        }
    }

    fn on_complete(&self, summary: &RunSummary) {
        tracing::info!(
            processed = summary.processed,
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            stop = %summary.stop,
            output = %summary.output.display(),
            "Dispatch finished"
        );
    }
}
