//! Payment records and webhook dedup markers.
//!
//! ## Design
//! - One `payments` row per checkout attempt, unique on provider session id
//!   and (when known) provider payment intent id
//! - Status moves PENDING → SUCCEEDED | FAILED and never back
//! - `processed_payment_events` holds one marker per applied webhook event
//! - Concurrent inserts are resolved by catching the uniqueness violation and
//!   re-reading the existing row

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::db::{from_millis, parse_column, to_millis, unique_race, Database};
use super::error::LedgerError;

// ── Payment status ───────────────────────────────────────────────

/// Status of a checkout attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    /// Session completed but funds not yet captured.
    Pending,
    /// Funds captured; tokens credited.
    Succeeded,
    /// Payment failed; nothing credited.
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Payment record ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Internal payment id; also the `ref_id` of the PURCHASE transaction.
    pub id: String,
    pub user_id: String,
    /// Token pack purchased, when the session named one.
    pub pack_id: Option<String>,
    pub provider_session_id: String,
    pub provider_payment_intent_id: Option<String>,
    pub amount_cents: i64,
    /// Tokens granted (or to be granted) for this payment.
    pub credited_tokens: i64,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// New record for a checkout session.
    pub fn for_session(
        user_id: &str,
        provider_session_id: &str,
        amount_cents: i64,
        credited_tokens: i64,
        status: PaymentStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            pack_id: None,
            provider_session_id: provider_session_id.to_string(),
            provider_payment_intent_id: None,
            amount_cents,
            credited_tokens,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    /// Idempotency key of the PURCHASE transaction crediting this payment.
    pub fn credit_key(&self) -> String {
        format!("payment:{}:purchase", self.id)
    }
}

// ── Store ────────────────────────────────────────────────────────

/// Owner of the `payments` and `processed_payment_events` tables.
pub struct PaymentEventStore {
    db: Arc<Database>,
}

impl PaymentEventStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// True if the event's side effects were already applied.
    pub fn is_processed(&self, event_id: &str) -> Result<bool, LedgerError> {
        self.db.read(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM processed_payment_events WHERE event_id = ?1",
                    params![event_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Record an event as applied. Returns `false` if it was already marked.
    pub fn mark_processed(&self, event_id: &str) -> Result<bool, LedgerError> {
        let result = self.db.write(|tx| {
            tx.execute(
                "INSERT INTO processed_payment_events (event_id, processed_at) VALUES (?1, ?2)",
                params![event_id, to_millis(Utc::now())],
            )
            .map_err(|e| unique_race(e, "processed_payment_events.event_id"))?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(true),
            Err(LedgerError::UniqueConstraintRace { .. }) => {
                tracing::debug!(%event_id, "Event already marked processed by a concurrent delivery");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, payment_id: &str) -> Result<Option<Payment>, LedgerError> {
        self.select_one("id", payment_id)
    }

    pub fn find_by_session(&self, session_id: &str) -> Result<Option<Payment>, LedgerError> {
        self.select_one("provider_session_id", session_id)
    }

    pub fn find_by_intent(&self, payment_intent_id: &str) -> Result<Option<Payment>, LedgerError> {
        self.select_one("provider_payment_intent_id", payment_intent_id)
    }

    /// Insert a new payment. A duplicate session or intent id surfaces as
    /// `UniqueConstraintRace`.
    pub fn insert(&self, payment: &Payment) -> Result<(), LedgerError> {
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO payments (id, user_id, pack_id, provider_session_id, provider_payment_intent_id,
                                       amount_cents, credited_tokens, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    payment.id,
                    payment.user_id,
                    payment.pack_id,
                    payment.provider_session_id,
                    payment.provider_payment_intent_id,
                    payment.amount_cents,
                    payment.credited_tokens,
                    payment.status.as_str(),
                    to_millis(payment.created_at),
                    to_millis(payment.updated_at),
                ],
            )
            .map_err(|e| unique_race(e, "payments.provider_session_id"))?;
            Ok(())
        })
    }

    /// Bring the payment for `payment.provider_session_id` to `payment.status`.
    ///
    /// Inserts the row if missing; a concurrent insert is recovered by
    /// re-reading. An existing PENDING row is advanced; a PENDING request
    /// leaves any existing row as it is. A row already in a different
    /// terminal status is an invariant violation.
    pub fn upsert_checkout(&self, payment: &Payment) -> Result<Payment, LedgerError> {
        let existing = match self.find_by_session(&payment.provider_session_id)? {
            Some(existing) => existing,
            None => match self.insert(payment) {
                Ok(()) => return Ok(payment.clone()),
                Err(LedgerError::UniqueConstraintRace { .. }) => {
                    let existing = self
                        .find_by_session(&payment.provider_session_id)?
                        .ok_or_else(|| {
                            LedgerError::InvariantViolation(format!(
                                "payment for session {} collided but was not found",
                                payment.provider_session_id
                            ))
                        })?;
                    if existing.status != payment.status {
                        tracing::error!(
                            session_id = %payment.provider_session_id,
                            existing = %existing.status,
                            expected = %payment.status,
                            "Payment insert race found row in unexpected status"
                        );
                        return Err(LedgerError::InvariantViolation(format!(
                            "payment {} is {} after insert race, expected {}",
                            existing.id, existing.status, payment.status
                        )));
                    }
                    return Ok(existing);
                }
                Err(e) => return Err(e),
            },
        };

        // A pending observation never moves an existing row backwards.
        if existing.status == payment.status || payment.status == PaymentStatus::Pending {
            return Ok(existing);
        }
        if existing.status.is_terminal() {
            tracing::error!(
                payment_id = %existing.id,
                existing = %existing.status,
                requested = %payment.status,
                "Payment in unexpected status"
            );
            return Err(LedgerError::InvariantViolation(format!(
                "payment {} is {}, cannot become {}",
                existing.id, existing.status, payment.status
            )));
        }

        self.mark_status(&existing.id, payment.status)?;
        self.get(&existing.id)?.ok_or_else(|| {
            LedgerError::InvariantViolation(format!("payment {} vanished", existing.id))
        })
    }

    /// Move a PENDING payment to `status`. Returns `false` if it was not PENDING.
    pub fn mark_status(&self, payment_id: &str, status: PaymentStatus) -> Result<bool, LedgerError> {
        self.db.write(|tx| {
            let updated = tx.execute(
                "UPDATE payments SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'PENDING'",
                params![status.as_str(), to_millis(Utc::now()), payment_id],
            )?;
            Ok(updated > 0)
        })
    }

    /// Attach the provider payment intent id once it is known.
    pub fn set_intent(&self, payment_id: &str, payment_intent_id: &str) -> Result<(), LedgerError> {
        self.db.write(|tx| {
            tx.execute(
                "UPDATE payments SET provider_payment_intent_id = ?1, updated_at = ?2
                 WHERE id = ?3 AND provider_payment_intent_id IS NULL",
                params![payment_intent_id, to_millis(Utc::now()), payment_id],
            )
            .map_err(|e| unique_race(e, "payments.provider_payment_intent_id"))?;
            Ok(())
        })
    }

    /// Payments for a user, newest first.
    pub fn list_user_payments(&self, user_id: &str, limit: usize) -> Result<Vec<Payment>, LedgerError> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, pack_id, provider_session_id, provider_payment_intent_id,
                        amount_cents, credited_tokens, status, created_at, updated_at
                 FROM payments WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![user_id, limit], payment_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn select_one(&self, column: &'static str, value: &str) -> Result<Option<Payment>, LedgerError> {
        self.db.read(|conn| {
            let sql = format!(
                "SELECT id, user_id, pack_id, provider_session_id, provider_payment_intent_id,
                        amount_cents, credited_tokens, status, created_at, updated_at
                 FROM payments WHERE {column} = ?1"
            );
            Ok(conn
                .query_row(&sql, params![value], payment_from_row)
                .optional()?)
        })
    }
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let status: String = row.get(7)?;
    Ok(Payment {
        id: row.get(0)?,
        user_id: row.get(1)?,
        pack_id: row.get(2)?,
        provider_session_id: row.get(3)?,
        provider_payment_intent_id: row.get(4)?,
        amount_cents: row.get(5)?,
        credited_tokens: row.get(6)?,
        status: parse_column(7, &status)?,
        created_at: from_millis(row.get(8)?),
        updated_at: from_millis(row.get(9)?),
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_store() -> (TempDir, PaymentEventStore) {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&tmp.path().join("ledger.db")).unwrap());
        (tmp, PaymentEventStore::new(db))
    }

    fn succeeded(session: &str) -> Payment {
        Payment::for_session("user-1", session, 500, 10_000, PaymentStatus::Succeeded)
    }

    #[test]
    fn payment_status_roundtrip() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Succeeded,
            PaymentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
        assert!("refunded".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn mark_processed_is_idempotent() {
        let (_tmp, store) = make_store();
        assert!(!store.is_processed("evt_1").unwrap());
        assert!(store.mark_processed("evt_1").unwrap());
        assert!(!store.mark_processed("evt_1").unwrap());
        assert!(store.is_processed("evt_1").unwrap());
    }

    #[test]
    fn insert_and_find_by_session() {
        let (_tmp, store) = make_store();
        let payment = succeeded("cs_1");
        store.insert(&payment).unwrap();

        let found = store.find_by_session("cs_1").unwrap().unwrap();
        assert_eq!(found.id, payment.id);
        assert_eq!(found.status, PaymentStatus::Succeeded);
        assert!(store.find_by_session("cs_missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_session_insert_is_a_race() {
        let (_tmp, store) = make_store();
        store.insert(&succeeded("cs_1")).unwrap();
        let err = store.insert(&succeeded("cs_1")).unwrap_err();
        assert!(matches!(err, LedgerError::UniqueConstraintRace { .. }));
    }

    #[test]
    fn upsert_returns_existing_row_in_same_status() {
        let (_tmp, store) = make_store();
        let first = store.upsert_checkout(&succeeded("cs_1")).unwrap();
        let second = store.upsert_checkout(&succeeded("cs_1")).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn upsert_advances_pending_row() {
        let (_tmp, store) = make_store();
        let pending = Payment::for_session("user-1", "cs_1", 500, 10_000, PaymentStatus::Pending);
        let pending = store.upsert_checkout(&pending).unwrap();

        let done = store.upsert_checkout(&succeeded("cs_1")).unwrap();
        assert_eq!(done.id, pending.id);
        assert_eq!(done.status, PaymentStatus::Succeeded);
    }

    #[test]
    fn pending_observation_keeps_succeeded_row() {
        let (_tmp, store) = make_store();
        store.upsert_checkout(&succeeded("cs_1")).unwrap();
        let pending = Payment::for_session("user-1", "cs_1", 500, 10_000, PaymentStatus::Pending);
        let stored = store.upsert_checkout(&pending).unwrap();
        assert_eq!(stored.status, PaymentStatus::Succeeded);
    }

    #[test]
    fn upsert_refuses_failed_to_succeeded() {
        let (_tmp, store) = make_store();
        let failed = Payment::for_session("user-1", "cs_1", 500, 10_000, PaymentStatus::Failed);
        store.insert(&failed).unwrap();

        let err = store.upsert_checkout(&succeeded("cs_1")).unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
    }

    #[test]
    fn mark_status_only_from_pending() {
        let (_tmp, store) = make_store();
        let pending = Payment::for_session("user-1", "cs_1", 500, 10_000, PaymentStatus::Pending);
        store.insert(&pending).unwrap();

        assert!(store.mark_status(&pending.id, PaymentStatus::Failed).unwrap());
        assert!(!store.mark_status(&pending.id, PaymentStatus::Succeeded).unwrap());
        assert_eq!(
            store.get(&pending.id).unwrap().unwrap().status,
            PaymentStatus::Failed
        );
    }

    #[test]
    fn set_intent_enables_lookup_and_is_unique() {
        let (_tmp, store) = make_store();
        let a = succeeded("cs_a");
        let b = succeeded("cs_b");
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        store.set_intent(&a.id, "pi_1").unwrap();
        assert_eq!(store.find_by_intent("pi_1").unwrap().unwrap().id, a.id);

        let err = store.set_intent(&b.id, "pi_1").unwrap_err();
        assert!(matches!(err, LedgerError::UniqueConstraintRace { .. }));
    }

    #[test]
    fn list_user_payments_limit() {
        let (_tmp, store) = make_store();
        for i in 0..3 {
            store.insert(&succeeded(&format!("cs_{i}"))).unwrap();
        }
        assert_eq!(store.list_user_payments("user-1", 2).unwrap().len(), 2);
        assert!(store.list_user_payments("user-2", 10).unwrap().is_empty());
    }

    #[test]
    fn credit_key_is_stable_per_payment() {
        let payment = succeeded("cs_1");
        assert_eq!(payment.credit_key(), payment.credit_key());
        assert!(payment.credit_key().contains(&payment.id));
    }
}
