//! SQLite handle shared by the balance store, the ledger and the payment store.
//!
//! Tables:
//! - `balances`: per-user available/reserved counters with a version column
//! - `reservations`: ACTIVE/COMMITTED/RELEASED holds
//! - `token_transactions`: append-only log, `idempotency_key` unique when set
//! - `payments`: one row per checkout attempt
//! - `processed_payment_events`: webhook dedup markers

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

use super::error::LedgerError;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the ledger database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create ledger dir: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open ledger DB: {}", db_path.display()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, mostly for tooling that must not touch disk.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS balances (
                user_id          TEXT PRIMARY KEY,
                available_tokens INTEGER NOT NULL DEFAULT 0 CHECK (available_tokens >= 0),
                reserved_tokens  INTEGER NOT NULL DEFAULT 0 CHECK (reserved_tokens >= 0),
                version          INTEGER NOT NULL DEFAULT 0,
                updated_at       INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reservations (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL,
                ref_id           TEXT NOT NULL,
                estimated_tokens INTEGER NOT NULL,
                committed_tokens INTEGER,
                state            TEXT NOT NULL,
                expires_at       INTEGER NOT NULL,
                created_at       INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_expiry ON reservations(state, expires_at);
            CREATE INDEX IF NOT EXISTS idx_reservations_user ON reservations(user_id);

            CREATE TABLE IF NOT EXISTS token_transactions (
                id                      TEXT PRIMARY KEY,
                user_id                 TEXT NOT NULL,
                tx_type                 TEXT NOT NULL,
                source                  TEXT NOT NULL,
                amount_tokens           INTEGER NOT NULL,
                ref_id                  TEXT NOT NULL,
                idempotency_key         TEXT UNIQUE,
                balance_after_available INTEGER NOT NULL,
                balance_after_reserved  INTEGER NOT NULL,
                metadata                TEXT,
                created_at              INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_token_tx_user ON token_transactions(user_id, created_at);

            CREATE TABLE IF NOT EXISTS payments (
                id                          TEXT PRIMARY KEY,
                user_id                     TEXT NOT NULL,
                pack_id                     TEXT,
                provider_session_id         TEXT NOT NULL UNIQUE,
                provider_payment_intent_id  TEXT UNIQUE,
                amount_cents                INTEGER NOT NULL,
                credited_tokens             INTEGER NOT NULL,
                status                      TEXT NOT NULL,
                created_at                  INTEGER NOT NULL,
                updated_at                  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payments_user ON payments(user_id);

            CREATE TABLE IF NOT EXISTS processed_payment_events (
                event_id     TEXT PRIMARY KEY,
                processed_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Run `f` against the connection without a transaction.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a SQLite transaction; committed on `Ok`, rolled back on `Err`.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// True when the error is a UNIQUE or PRIMARY KEY constraint violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Map a unique violation to `UniqueConstraintRace`, anything else to storage.
pub fn unique_race(err: rusqlite::Error, constraint: &'static str) -> LedgerError {
    if is_unique_violation(&err) {
        LedgerError::UniqueConstraintRace { constraint }
    } else {
        LedgerError::Storage(err)
    }
}

/// Parse a TEXT column into an enum, surfacing unknown values as conversion errors.
pub(crate) fn parse_column<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
