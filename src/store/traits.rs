//! `HistoryGate` trait: the narrow async interface the dispatch engine uses
//! for dedup and rate-limit decisions.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use secrecy::SecretString;

use crate::error::DatabaseError;

/// Final status of a delivery, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Failed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn from_ok(ok: bool) -> Self {
        if ok { Self::Success } else { Self::Failed }
    }
}

impl std::str::FromStr for SendStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(DatabaseError::Query(format!("unknown send status '{other}'"))),
        }
    }
}

/// One delivery outcome, queued by the engine and written in batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    pub account_id: i64,
    pub recipient: String,
    pub message: String,
    pub status: SendStatus,
    pub sent_at: DateTime<Utc>,
}

/// A named delivery account: gateway endpoint plus credential.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    pub credential: SecretString,
    pub created_at: DateTime<Utc>,
}

/// Dedup and daily-count queries plus batched persistence.
#[async_trait]
pub trait HistoryGate: Send + Sync {
    /// Successful sends for `account_id` since local midnight.
    async fn daily_count(&self, account_id: i64) -> Result<u64, DatabaseError>;

    /// Whether any account delivered to `recipient` since local midnight.
    async fn was_sent_today(&self, recipient: &str) -> Result<bool, DatabaseError>;

    /// Persist a batch in one transaction. An empty slice is a no-op.
    async fn record_batch(&self, records: &[SendRecord]) -> Result<(), DatabaseError>;
}

/// History disabled: nothing is remembered and nothing is counted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHistory;

#[async_trait]
impl HistoryGate for NoHistory {
    async fn daily_count(&self, _account_id: i64) -> Result<u64, DatabaseError> {
        Ok(0)
    }

    async fn was_sent_today(&self, _recipient: &str) -> Result<bool, DatabaseError> {
        Ok(false)
    }

    async fn record_batch(&self, _records: &[SendRecord]) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// Start of the current local calendar day, in UTC.
pub fn start_of_local_day(now: DateTime<Local>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&midnight).earliest() {
        Some(start) => start.with_timezone(&Utc),
        // Midnight skipped by a DST jump: apply the current offset instead.
        None => {
            let offset = chrono::Duration::seconds(i64::from(now.offset().local_minus_utc()));
            (midnight - offset).and_utc()
        }
    }
}
