//! SQLite connection, schema and shared column helpers.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, Row};
use thiserror::Error;

use crate::incidents::types::ErrorType;

/// Errors from the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger lock poisoned")]
    Lock,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl LedgerError {
    /// Storage failures that can succeed on a later attempt: a busy or locked
    /// database, an I/O error, a poisoned connection lock.
    ///
    /// Constraint violations and rows that do not decode are data problems.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Lock => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => e.code != ErrorCode::ConstraintViolation,
            _ => false,
        }
    }

    /// Incident class of a failure that surfaced from the ledger.
    pub fn error_type(&self) -> ErrorType {
        if self.is_transient() {
            ErrorType::TimeoutError
        } else {
            ErrorType::ValidationError
        }
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user_wallets (
    user_id TEXT PRIMARY KEY,
    address TEXT NOT NULL UNIQUE,
    public_key TEXT NOT NULL,
    encrypted_private_key TEXT NOT NULL,
    derivation_path TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS deposits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_hash TEXT NOT NULL,
    log_index INTEGER NOT NULL DEFAULT 0,
    token TEXT NOT NULL,
    from_address TEXT NOT NULL,
    to_address TEXT NOT NULL,
    user_id TEXT NOT NULL,
    amount TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    confirmations INTEGER NOT NULL,
    status TEXT NOT NULL,
    swept INTEGER NOT NULL DEFAULT 0,
    sweep_tx_hash TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (tx_hash, token, log_index)
);

CREATE INDEX IF NOT EXISTS idx_deposits_to_token ON deposits(to_address, token, swept);
CREATE INDEX IF NOT EXISTS idx_deposits_status ON deposits(status);

CREATE TABLE IF NOT EXISTS sweeps (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    from_address TEXT NOT NULL,
    to_address TEXT NOT NULL,
    token TEXT NOT NULL,
    amount TEXT NOT NULL,
    observed_balance TEXT NOT NULL,
    gas_limit INTEGER NOT NULL,
    gas_price TEXT NOT NULL,
    gas_used INTEGER,
    gas_cost TEXT NOT NULL,
    tx_hash TEXT,
    status TEXT NOT NULL,
    error TEXT,
    related_deposits TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sweeps_from_token ON sweeps(from_address, token, created_at);
CREATE INDEX IF NOT EXISTS idx_sweeps_status ON sweeps(status);

CREATE TABLE IF NOT EXISTS gas_supply_logs (
    id TEXT PRIMARY KEY,
    to_address TEXT NOT NULL,
    from_address TEXT NOT NULL,
    amount TEXT NOT NULL,
    tx_hash TEXT,
    supply_type TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    operator TEXT,
    balance_before TEXT NOT NULL,
    balance_after TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gas_to ON gas_supply_logs(to_address, created_at);

CREATE TABLE IF NOT EXISTS gas_requests (
    id TEXT PRIMARY KEY,
    to_address TEXT NOT NULL,
    min_required TEXT,
    operator TEXT NOT NULL,
    status TEXT NOT NULL,
    supply_log_id TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gas_requests_status ON gas_requests(status, created_at);

CREATE TABLE IF NOT EXISTS system_incidents (
    id TEXT PRIMARY KEY,
    error_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    retry_strategy TEXT NOT NULL,
    next_retry_at INTEGER,
    is_escalated INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    resolved_by TEXT,
    resolution_note TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_incidents_status ON system_incidents(status, next_retry_at);
CREATE INDEX IF NOT EXISTS idx_incidents_entity ON system_incidents(entity_type, entity_id);
"#;

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open or create the database file and apply the schema.
    pub fn open(path: &str) -> LedgerResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.migrate()?;
        tracing::info!(path, "Ledger opened");
        Ok(ledger)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> LedgerResult<Self> {
        let ledger = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        ledger.migrate()?;
        Ok(ledger)
    }

    /// Run database migrations.
    pub fn migrate(&self) -> LedgerResult<()> {
        self.with_conn(|conn| conn.execute_batch(SCHEMA))
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> LedgerResult<T> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Lock)?;
        Ok(f(&conn)?)
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let mut conn = self.conn.lock().map_err(|_| LedgerError::Lock)?;
        f(&mut conn)
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

/// Millisecond timestamp stored in INTEGER columns.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {ms}")))
}

/// Addresses are stored lowercase so equality is case-insensitive.
pub(crate) fn address_key(address: &alloy::primitives::Address) -> String {
    address.to_string().to_lowercase()
}

pub(crate) fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

/// Read a TEXT column and parse it.
pub(crate) fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let text: String = row.get(idx)?;
    crate::ledger::models::parse_field(&text).map_err(|e| conversion_error(idx, e))
}

/// Read a nullable TEXT column and parse it.
pub(crate) fn parsed_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| crate::ledger::models::parse_field(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    from_millis(idx, ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.migrate().unwrap();
        ledger.migrate().unwrap();

        let tables: i64 = ledger
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();
        Ledger::open(path).unwrap();
        // Re-opening applies the schema again without error.
        Ledger::open(path).unwrap();
    }

    #[test]
    fn test_busy_database_is_retryable() {
        let busy = LedgerError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ));
        assert!(busy.is_transient());
        assert_eq!(busy.error_type(), ErrorType::TimeoutError);
        assert_eq!(LedgerError::Lock.error_type(), ErrorType::TimeoutError);

        let constraint = LedgerError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert_eq!(constraint.error_type(), ErrorType::ValidationError);
        assert_eq!(
            LedgerError::InvalidTransition("done".to_string()).error_type(),
            ErrorType::ValidationError
        );
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(0, to_millis(now)).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
