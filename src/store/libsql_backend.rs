//! libSQL backend: send history and the account registry.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 UTC text with fixed microsecond precision, so lexical order
//! matches time order and day-window queries stay on the indices.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Account, HistoryGate, SendRecord, start_of_local_day};

/// libSQL history store.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlHistory {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlHistory {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "History store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests and throwaway runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Accounts ────────────────────────────────────────────────────

    /// Register a new account. Names are unique.
    pub async fn add_account(
        &self,
        name: &str,
        endpoint: &str,
        credential: &SecretString,
    ) -> Result<Account, DatabaseError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DatabaseError::Constraint("account name must not be empty".into()));
        }

        self.conn()
            .execute(
                "INSERT INTO accounts (name, endpoint, credential, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, endpoint, credential.expose_secret(), timestamp(Utc::now())],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    DatabaseError::Constraint(format!("account '{name}' already exists"))
                } else {
                    DatabaseError::Query(format!("add_account: {e}"))
                }
            })?;

        info!(account = name, "Account registered");
        self.account_by_name(name)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "account".into(),
                id: name.to_string(),
            })
    }

    pub async fn account_by_name(&self, name: &str) -> Result<Option<Account>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, endpoint, credential, created_at FROM accounts WHERE name = ?1",
                params![name.trim()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("account_by_name: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_account(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("account_by_name: {e}"))),
        }
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, endpoint, credential, created_at FROM accounts ORDER BY name",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_accounts: {e}")))?;

        let mut accounts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_accounts: {e}")))?
        {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    /// Look up `name`, registering it with `endpoint` and no stored
    /// credential when absent. An existing account keeps its endpoint.
    pub async fn ensure_account(&self, name: &str, endpoint: &str) -> Result<Account, DatabaseError> {
        if let Some(account) = self.account_by_name(name).await? {
            return Ok(account);
        }
        self.add_account(name, endpoint, &SecretString::from(String::new()))
            .await
    }

    async fn count_since(&self, sql: &str, key: libsql::Value) -> Result<u64, DatabaseError> {
        let since = timestamp(start_of_local_day(Local::now()));
        let mut rows = self
            .conn()
            .query(sql, params![key, since])
            .await
            .map_err(|e| DatabaseError::Query(format!("count_since: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_since: {e}")))?;
        let count: i64 = match row {
            Some(row) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count_since: {e}")))?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl HistoryGate for LibSqlHistory {
    async fn daily_count(&self, account_id: i64) -> Result<u64, DatabaseError> {
        self.count_since(
            "SELECT COUNT(*) FROM send_records
             WHERE account_id = ?1 AND status = 'success' AND sent_at >= ?2",
            libsql::Value::Integer(account_id),
        )
        .await
    }

    async fn was_sent_today(&self, recipient: &str) -> Result<bool, DatabaseError> {
        let count = self
            .count_since(
                "SELECT COUNT(*) FROM (
                     SELECT 1 FROM send_records
                     WHERE recipient = ?1 AND status = 'success' AND sent_at >= ?2
                     LIMIT 1
                 )",
                libsql::Value::Text(recipient.to_string()),
            )
            .await?;
        Ok(count > 0)
    }

    async fn record_batch(&self, records: &[SendRecord]) -> Result<(), DatabaseError> {
        if records.is_empty() {
            return Ok(());
        }

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_batch begin: {e}")))?;

        for record in records {
            tx.execute(
                "INSERT INTO send_records (account_id, recipient, message, status, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.account_id,
                    record.recipient.as_str(),
                    record.message.as_str(),
                    record.status.as_str(),
                    timestamp(record.sent_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_batch insert: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_batch commit: {e}")))?;
        debug!(count = records.len(), "Send history batch written");
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_account(row: &libsql::Row) -> Result<Account, DatabaseError> {
    let created_str: String = row.get(4).unwrap_or_default();
    Ok(Account {
        id: row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("account id: {e}")))?,
        name: row.get(1).unwrap_or_default(),
        endpoint: row.get(2).unwrap_or_default(),
        credential: SecretString::from(row.get::<String>(3).unwrap_or_default()),
        created_at: parse_datetime(&created_str),
    })
}

/// Read back every stored record, oldest first. Test helper.
#[cfg(test)]
impl LibSqlHistory {
    async fn all_records(&self) -> Vec<SendRecord> {
        let mut rows = self
            .conn()
            .query(
                "SELECT account_id, recipient, message, status, sent_at FROM send_records ORDER BY id",
                (),
            )
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let status: String = row.get(3).unwrap();
            let sent_at: String = row.get(4).unwrap();
            out.push(SendRecord {
                account_id: row.get(0).unwrap(),
                recipient: row.get(1).unwrap(),
                message: row.get(2).unwrap(),
                status: status.parse().unwrap(),
                sent_at: parse_datetime(&sent_at),
            });
        }
        out
    }
}

// ── Tests ───────────────────────────────────────────────────────────
