//! Per-user available/reserved token counters with optimistic versioning.
//!
//! Rows are created lazily with zero balances. Every write goes through
//! [`BalanceStore::save`], which only succeeds when the stored version still
//! matches the version that was read.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::db::{from_millis, to_millis, Database};
use super::error::LedgerError;

/// A user's token balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: String,
    /// Tokens free to reserve or spend.
    pub available_tokens: i64,
    /// Tokens held by ACTIVE reservations.
    pub reserved_tokens: i64,
    /// Incremented on every successful save.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    /// Zero balance for a user with no row yet.
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            available_tokens: 0,
            reserved_tokens: 0,
            version: 0,
            updated_at: DateTime::<Utc>::default(),
        }
    }

    /// Apply signed deltas, refusing to produce a negative counter.
    pub fn adjusted(&self, available_delta: i64, reserved_delta: i64) -> Result<Self, LedgerError> {
        let available = self
            .available_tokens
            .checked_add(available_delta)
            .ok_or_else(|| LedgerError::InvalidArgument("token amount overflows".into()))?;
        let reserved = self
            .reserved_tokens
            .checked_add(reserved_delta)
            .ok_or_else(|| LedgerError::InvalidArgument("token amount overflows".into()))?;

        if available < 0 || reserved < 0 {
            return Err(LedgerError::InvariantViolation(format!(
                "balance of {} would go negative (available {available}, reserved {reserved})",
                self.user_id
            )));
        }

        Ok(Self {
            available_tokens: available,
            reserved_tokens: reserved,
            ..self.clone()
        })
    }

    pub fn total(&self) -> i64 {
        self.available_tokens + self.reserved_tokens
    }
}

/// Owner of the `balances` table.
pub struct BalanceStore {
    db: Arc<Database>,
}

impl BalanceStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Current balance, or `None` if the user never held tokens.
    pub fn get(&self, user_id: &str) -> Result<Option<Balance>, LedgerError> {
        self.db.read(|conn| Self::select(conn, user_id))
    }

    /// Current balance, creating a zero row if none exists.
    pub fn load_or_create(&self, user_id: &str) -> Result<Balance, LedgerError> {
        self.db.write(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO balances (user_id, available_tokens, reserved_tokens, version, updated_at)
                 VALUES (?1, 0, 0, 0, ?2)",
                params![user_id, to_millis(Utc::now())],
            )?;
            Self::select(tx, user_id)?.ok_or_else(|| {
                LedgerError::InvariantViolation(format!("balance row for {user_id} vanished"))
            })
        })
    }

    /// Persist `balance` if its version is still current.
    ///
    /// Must run inside the caller's write transaction so the balance change
    /// commits or rolls back together with the ledger rows that explain it.
    /// Returns the saved balance with its new version.
    pub fn save(&self, conn: &Connection, balance: &Balance) -> Result<Balance, LedgerError> {
        let now = Utc::now();
        let updated = conn.execute(
            "UPDATE balances SET
                available_tokens = ?1,
                reserved_tokens = ?2,
                version = version + 1,
                updated_at = ?3
             WHERE user_id = ?4 AND version = ?5",
            params![
                balance.available_tokens,
                balance.reserved_tokens,
                to_millis(now),
                balance.user_id,
                balance.version,
            ],
        )?;

        if updated == 0 {
            return Err(LedgerError::OptimisticLockConflict {
                user_id: balance.user_id.clone(),
            });
        }

        Ok(Balance {
            version: balance.version + 1,
            updated_at: now,
            ..balance.clone()
        })
    }

    fn select(conn: &Connection, user_id: &str) -> Result<Option<Balance>, LedgerError> {
        let balance = conn
            .query_row(
                "SELECT user_id, available_tokens, reserved_tokens, version, updated_at
                 FROM balances WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(Balance {
                        user_id: row.get(0)?,
                        available_tokens: row.get(1)?,
                        reserved_tokens: row.get(2)?,
                        version: row.get(3)?,
                        updated_at: from_millis(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(balance)
    }
}
