//! Token ledger: reservation lifecycle, credits and the append-only transaction log.
//!
//! ## Design
//! - `reserve` moves tokens from available to reserved and opens an ACTIVE reservation
//! - `commit` settles a reservation at the actual cost; `release` returns it in full
//! - `credit_purchase` / `credit_refund` add tokens without a reservation
//! - Idempotency keys are unique in `token_transactions`; a replay returns the
//!   original result, a mismatched replay is an `IdempotencyConflict`
//! - Balance writes are optimistic (version check) and retried through [`LockRetry`]
//! - Each mutation writes the balance, the reservation and the transaction row
//!   in one SQLite transaction

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::balance::{Balance, BalanceStore};
use super::db::{from_millis, parse_column, to_millis, unique_race, Database};
use super::error::LedgerError;
use super::retry::LockRetry;
use crate::config::LedgerConfig;

/// Maximum accepted user id length.
const MAX_USER_ID_LEN: usize = 128;

const IDEMPOTENCY_CONSTRAINT: &str = "token_transactions.idempotency_key";

/// Opaque audit map attached to a transaction.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Encode audit metadata for storage.
///
/// A serialization failure is logged and yields `None`; it never fails the
/// ledger operation the metadata describes.
pub fn audit_metadata<T: Serialize + ?Sized>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(encoded) => Some(encoded),
        Err(e) => {
            tracing::warn!("Failed to serialize audit metadata, storing none: {e}");
            None
        }
    }
}

// ── Reservation ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReservationState {
    /// Holding tokens; the only non-terminal state.
    Active,
    Committed,
    Released,
}

impl ReservationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Committed => "COMMITTED",
            Self::Released => "RELEASED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl FromStr for ReservationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "COMMITTED" => Ok(Self::Committed),
            "RELEASED" => Ok(Self::Released),
            other => Err(format!("unknown reservation state: {other}")),
        }
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisional hold on tokens pending commit or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    /// Caller's reference for the work being billed (e.g. a job id).
    pub ref_id: String,
    pub estimated_tokens: i64,
    /// Set on commit.
    pub committed_tokens: Option<i64>,
    pub state: ReservationState,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Active && self.expires_at < now
    }
}

// ── Transactions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Reserve,
    Commit,
    Release,
    Purchase,
    Refund,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserve => "RESERVE",
            Self::Commit => "COMMIT",
            Self::Release => "RELEASE",
            Self::Purchase => "PURCHASE",
            Self::Refund => "REFUND",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESERVE" => Ok(Self::Reserve),
            "COMMIT" => Ok(Self::Commit),
            "RELEASE" => Ok(Self::Release),
            "PURCHASE" => Ok(Self::Purchase),
            "REFUND" => Ok(Self::Refund),
            other => Err(format!("unknown transaction type: {other}")),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem that caused a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    /// Reservation lifecycle driven by job billing (including expiry).
    JobBilling,
    /// One-off purchases and restorations from payment webhooks.
    PaymentWebhook,
    /// Recurring subscription invoices.
    Subscription,
    /// Operator tooling.
    Manual,
}

impl TransactionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobBilling => "job_billing",
            Self::PaymentWebhook => "payment_webhook",
            Self::Subscription => "subscription",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for TransactionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job_billing" => Ok(Self::JobBilling),
            "payment_webhook" => Ok(Self::PaymentWebhook),
            "subscription" => Ok(Self::Subscription),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown transaction source: {other}")),
        }
    }
}

/// An append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub id: String,
    pub user_id: String,
    pub tx_type: TransactionType,
    pub source: TransactionSource,
    pub amount_tokens: i64,
    /// Reservation id or payment id this entry explains.
    pub ref_id: String,
    pub idempotency_key: Option<String>,
    pub balance_after_available: i64,
    pub balance_after_reserved: i64,
    /// Encoded audit metadata.
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TokenTransaction {
    #[allow(clippy::too_many_arguments)]
    fn new(
        balance: &Balance,
        tx_type: TransactionType,
        source: TransactionSource,
        amount_tokens: i64,
        ref_id: &str,
        idempotency_key: Option<&str>,
        metadata: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: balance.user_id.clone(),
            tx_type,
            source,
            amount_tokens,
            ref_id: ref_id.to_string(),
            idempotency_key: idempotency_key.map(str::to_string),
            balance_after_available: balance.available_tokens,
            balance_after_reserved: balance.reserved_tokens,
            metadata,
            created_at: now,
        }
    }

    /// Decoded audit metadata, if any was stored.
    pub fn metadata_json(&self) -> Option<serde_json::Value> {
        self.metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

// ── Credits ──────────────────────────────────────────────────────

/// A direct increase of a user's available tokens.
#[derive(Debug, Clone)]
pub struct Credit {
    pub user_id: String,
    pub tokens: i64,
    pub ref_id: String,
    pub idempotency_key: Option<String>,
    pub source: TransactionSource,
    pub metadata: Option<String>,
}

impl Credit {
    pub fn new(user_id: impl Into<String>, tokens: i64, ref_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tokens,
            ref_id: ref_id.into(),
            idempotency_key: None,
            source: TransactionSource::Manual,
            metadata: None,
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn source(mut self, source: TransactionSource) -> Self {
        self.source = source;
        self
    }

    /// Attach audit metadata; an unserializable value is dropped with a warning.
    pub fn metadata<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.metadata = audit_metadata(value);
        self
    }
}

/// Result of a credit.
#[derive(Debug, Clone)]
pub struct CreditReceipt {
    pub transaction: TokenTransaction,
    /// True when the idempotency key had already been applied.
    pub replayed: bool,
}

// ── Ledger ───────────────────────────────────────────────────────

pub struct TokenLedger {
    db: Arc<Database>,
    balances: Arc<BalanceStore>,
    reservation_ttl: TimeDelta,
    lock_retry: LockRetry,
}

impl TokenLedger {
    pub fn new(db: Arc<Database>, balances: Arc<BalanceStore>, config: &LedgerConfig) -> Self {
        let ttl_secs = i64::try_from(config.reservation_ttl_secs).unwrap_or(i64::MAX);
        Self {
            db,
            balances,
            reservation_ttl: TimeDelta::try_seconds(ttl_secs).unwrap_or(TimeDelta::MAX),
            lock_retry: LockRetry::new(config.max_lock_attempts),
        }
    }

    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.reservation_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Hold `estimated_tokens` of the user's available balance.
    pub fn reserve(
        &self,
        user_id: &str,
        estimated_tokens: i64,
        ref_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Reservation, LedgerError> {
        validate_user_id(user_id)?;
        if estimated_tokens <= 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "estimated tokens must be positive, got {estimated_tokens}"
            )));
        }

        if let Some(key) = idempotency_key {
            if let Some(existing) = self.replay_reservation(key, ref_id, estimated_tokens)? {
                tracing::debug!(reservation_id = %existing.id, "Reservation replayed for idempotency key");
                return Ok(existing);
            }
        }

        self.reserve_new(user_id, estimated_tokens, ref_id, idempotency_key)
    }

    fn reserve_new(
        &self,
        user_id: &str,
        estimated_tokens: i64,
        ref_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Reservation, LedgerError> {
        let result = self
            .lock_retry
            .run(|_| self.try_reserve(user_id, estimated_tokens, ref_id, idempotency_key));

        match (result, idempotency_key) {
            // Another request with the same key committed first.
            (Err(LedgerError::UniqueConstraintRace { .. }), Some(key)) => {
                tracing::debug!(%user_id, "Recovered reservation race via idempotency key");
                self.replay_reservation(key, ref_id, estimated_tokens)?
                    .ok_or_else(|| {
                        LedgerError::InvariantViolation(format!(
                            "idempotency key {key} collided but no transaction was found"
                        ))
                    })
            }
            // The winner may have spent the balance this request re-read.
            (Err(err @ LedgerError::InsufficientTokens { .. }), Some(key)) => {
                match self.replay_reservation(key, ref_id, estimated_tokens)? {
                    Some(existing) => {
                        tracing::debug!(%user_id, "Recovered reservation race via idempotency key");
                        Ok(existing)
                    }
                    None => Err(err),
                }
            }
            (result, _) => result,
        }
    }

    fn try_reserve(
        &self,
        user_id: &str,
        estimated_tokens: i64,
        ref_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Reservation, LedgerError> {
        let balance = self.balances.load_or_create(user_id)?;
        let now = Utc::now();

        if balance.available_tokens < estimated_tokens {
            return Err(LedgerError::InsufficientTokens {
                estimated: estimated_tokens,
                available: balance.available_tokens,
                shortfall: estimated_tokens - balance.available_tokens,
                ttl_deadline: self.deadline(now),
            });
        }

        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            ref_id: ref_id.to_string(),
            estimated_tokens,
            committed_tokens: None,
            state: ReservationState::Active,
            expires_at: self.deadline(now),
            created_at: now,
        };
        let updated = balance.adjusted(-estimated_tokens, estimated_tokens)?;
        let metadata = audit_metadata(&serde_json::json!({
            "estimatedTokens": estimated_tokens,
            "refId": ref_id,
        }));

        self.db.write(|tx| {
            let saved = self.balances.save(tx, &updated)?;
            insert_reservation(tx, &reservation)?;
            insert_transaction(
                tx,
                &TokenTransaction::new(
                    &saved,
                    TransactionType::Reserve,
                    TransactionSource::JobBilling,
                    0,
                    &reservation.id,
                    idempotency_key,
                    metadata,
                    now,
                ),
            )
        })?;

        tracing::debug!(
            %user_id,
            reservation_id = %reservation.id,
            estimated_tokens,
            "Tokens reserved"
        );
        Ok(reservation)
    }

    fn replay_reservation(
        &self,
        key: &str,
        ref_id: &str,
        estimated_tokens: i64,
    ) -> Result<Option<Reservation>, LedgerError> {
        let Some(existing) = self.find_transaction_by_key(key)? else {
            return Ok(None);
        };
        if existing.tx_type != TransactionType::Reserve {
            return Err(conflict(key, "already used for a different operation"));
        }

        let reservation = self.get_reservation(&existing.ref_id)?.ok_or_else(|| {
            LedgerError::InvariantViolation(format!(
                "reserve transaction {} points at missing reservation {}",
                existing.id, existing.ref_id
            ))
        })?;
        if reservation.estimated_tokens != estimated_tokens {
            return Err(conflict(key, "reused with different reservation amount"));
        }
        if reservation.ref_id != ref_id {
            return Err(conflict(key, "reused with a different reference"));
        }
        Ok(Some(reservation))
    }

    /// Settle an ACTIVE reservation at `actual_tokens`.
    ///
    /// Unused estimate returns to available; an overrun is drawn from available.
    pub fn commit(
        &self,
        reservation_id: &str,
        actual_tokens: i64,
        idempotency_key: Option<&str>,
    ) -> Result<TokenTransaction, LedgerError> {
        if actual_tokens < 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "actual tokens must not be negative, got {actual_tokens}"
            )));
        }

        if let Some(key) = idempotency_key {
            if let Some(existing) =
                self.replay_settlement(key, TransactionType::Commit, reservation_id, Some(actual_tokens))?
            {
                return Ok(existing);
            }
        }

        let result = self
            .lock_retry
            .run(|_| self.try_commit(reservation_id, actual_tokens, idempotency_key));
        self.recover_settlement(result, idempotency_key, TransactionType::Commit, reservation_id, Some(actual_tokens))
    }

    fn try_commit(
        &self,
        reservation_id: &str,
        actual_tokens: i64,
        idempotency_key: Option<&str>,
    ) -> Result<TokenTransaction, LedgerError> {
        let reservation = self.active_reservation(reservation_id)?;
        let balance = self.balances.load_or_create(&reservation.user_id)?;
        let estimated = reservation.estimated_tokens;

        // Positive: unused estimate returned. Negative: overrun drawn from available.
        let available_delta = estimated - actual_tokens;
        if available_delta < 0 && balance.available_tokens < -available_delta {
            let excess = -available_delta;
            return Err(LedgerError::InsufficientTokens {
                estimated: excess,
                available: balance.available_tokens,
                shortfall: excess - balance.available_tokens,
                ttl_deadline: reservation.expires_at,
            });
        }

        let updated = balance.adjusted(available_delta, -estimated)?;
        let now = Utc::now();
        let metadata = audit_metadata(&serde_json::json!({
            "estimatedTokens": estimated,
            "actualTokens": actual_tokens,
        }));

        let transaction = self.db.write(|tx| {
            let saved = self.balances.save(tx, &updated)?;
            transition_reservation(tx, &reservation, ReservationState::Committed, Some(actual_tokens))?;
            let transaction = TokenTransaction::new(
                &saved,
                TransactionType::Commit,
                TransactionSource::JobBilling,
                actual_tokens,
                &reservation.id,
                idempotency_key,
                metadata,
                now,
            );
            insert_transaction(tx, &transaction)?;
            Ok(transaction)
        })?;

        tracing::debug!(
            user_id = %reservation.user_id,
            reservation_id = %reservation.id,
            estimated,
            actual_tokens,
            "Reservation committed"
        );
        Ok(transaction)
    }

    /// Return an ACTIVE reservation's full estimate to available.
    pub fn release(
        &self,
        reservation_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<TokenTransaction, LedgerError> {
        if let Some(key) = idempotency_key {
            if let Some(existing) =
                self.replay_settlement(key, TransactionType::Release, reservation_id, None)?
            {
                return Ok(existing);
            }
        }

        let result = self
            .lock_retry
            .run(|_| self.try_release(reservation_id, idempotency_key, "released"));
        self.recover_settlement(result, idempotency_key, TransactionType::Release, reservation_id, None)
            .map(|(transaction, _)| transaction)
    }

    /// Release a reservation whose TTL elapsed. Returns the transaction and the
    /// balance after the update.
    pub fn release_expired(
        &self,
        reservation_id: &str,
    ) -> Result<(TokenTransaction, Balance), LedgerError> {
        self.lock_retry
            .run(|_| self.try_release(reservation_id, None, "expired"))
    }

    fn try_release(
        &self,
        reservation_id: &str,
        idempotency_key: Option<&str>,
        reason: &str,
    ) -> Result<(TokenTransaction, Balance), LedgerError> {
        let reservation = self.active_reservation(reservation_id)?;
        let balance = self.balances.load_or_create(&reservation.user_id)?;
        let estimated = reservation.estimated_tokens;
        let updated = balance.adjusted(estimated, -estimated)?;
        let now = Utc::now();
        let metadata = audit_metadata(&serde_json::json!({
            "estimatedTokens": estimated,
            "reason": reason,
        }));

        let released = self.db.write(|tx| {
            let saved = self.balances.save(tx, &updated)?;
            transition_reservation(tx, &reservation, ReservationState::Released, None)?;
            let transaction = TokenTransaction::new(
                &saved,
                TransactionType::Release,
                TransactionSource::JobBilling,
                estimated,
                &reservation.id,
                idempotency_key,
                metadata,
                now,
            );
            insert_transaction(tx, &transaction)?;
            Ok((transaction, saved))
        })?;

        tracing::debug!(
            user_id = %reservation.user_id,
            reservation_id = %reservation.id,
            estimated,
            reason,
            "Reservation released"
        );
        Ok(released)
    }

    fn active_reservation(&self, reservation_id: &str) -> Result<Reservation, LedgerError> {
        let reservation = self
            .get_reservation(reservation_id)?
            .ok_or_else(|| LedgerError::ReservationNotFound(reservation_id.to_string()))?;
        if reservation.state.is_terminal() {
            return Err(LedgerError::ReservationNotActive {
                id: reservation.id,
                state: reservation.state,
            });
        }
        Ok(reservation)
    }

    fn replay_settlement(
        &self,
        key: &str,
        tx_type: TransactionType,
        reservation_id: &str,
        amount: Option<i64>,
    ) -> Result<Option<TokenTransaction>, LedgerError> {
        let Some(existing) = self.find_transaction_by_key(key)? else {
            return Ok(None);
        };
        if existing.tx_type != tx_type {
            return Err(conflict(key, "already used for a different operation"));
        }
        if existing.ref_id != reservation_id {
            return Err(conflict(key, "reused for a different reservation"));
        }
        if amount.is_some_and(|a| a != existing.amount_tokens) {
            return Err(conflict(key, "reused with different commit amount"));
        }
        Ok(Some(existing))
    }

    fn recover_settlement<T: Settled>(
        &self,
        result: Result<T, LedgerError>,
        idempotency_key: Option<&str>,
        tx_type: TransactionType,
        reservation_id: &str,
        amount: Option<i64>,
    ) -> Result<T, LedgerError> {
        match (result, idempotency_key) {
            (Err(LedgerError::UniqueConstraintRace { .. }), Some(key)) => {
                let existing = self
                    .replay_settlement(key, tx_type, reservation_id, amount)?
                    .ok_or_else(|| {
                        LedgerError::InvariantViolation(format!(
                            "idempotency key {key} collided but no transaction was found"
                        ))
                    })?;
                T::from_replay(self, existing)
            }
            // Settled by a concurrent request; it is ours if it carries this key.
            (Err(err @ LedgerError::ReservationNotActive { .. }), Some(key)) => {
                match self.replay_settlement(key, tx_type, reservation_id, amount)? {
                    Some(existing) => T::from_replay(self, existing),
                    None => Err(err),
                }
            }
            (result, _) => result,
        }
    }

    /// Add purchased tokens to available.
    pub fn credit_purchase(&self, credit: Credit) -> Result<CreditReceipt, LedgerError> {
        self.credit(TransactionType::Purchase, credit)
    }

    /// Restore refunded or disputed tokens to available.
    pub fn credit_refund(&self, credit: Credit) -> Result<CreditReceipt, LedgerError> {
        self.credit(TransactionType::Refund, credit)
    }

    fn credit(&self, tx_type: TransactionType, credit: Credit) -> Result<CreditReceipt, LedgerError> {
        validate_user_id(&credit.user_id)?;
        if credit.tokens <= 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "credited tokens must be positive, got {}",
                credit.tokens
            )));
        }

        let key = credit.idempotency_key.as_deref();
        if let Some(key) = key {
            if let Some(existing) = self.replay_credit(key, tx_type, &credit)? {
                return Ok(CreditReceipt {
                    transaction: existing,
                    replayed: true,
                });
            }
        }

        let result = self.lock_retry.run(|_| {
            let balance = self.balances.load_or_create(&credit.user_id)?;
            let updated = balance.adjusted(credit.tokens, 0)?;
            let now = Utc::now();
            self.db.write(|tx| {
                let saved = self.balances.save(tx, &updated)?;
                let transaction = TokenTransaction::new(
                    &saved,
                    tx_type,
                    credit.source,
                    credit.tokens,
                    &credit.ref_id,
                    key,
                    credit.metadata.clone(),
                    now,
                );
                insert_transaction(tx, &transaction)?;
                Ok(transaction)
            })
        });

        let transaction = match (result, key) {
            (Err(LedgerError::UniqueConstraintRace { .. }), Some(key)) => {
                let existing = self.replay_credit(key, tx_type, &credit)?.ok_or_else(|| {
                    LedgerError::InvariantViolation(format!(
                        "idempotency key {key} collided but no transaction was found"
                    ))
                })?;
                return Ok(CreditReceipt {
                    transaction: existing,
                    replayed: true,
                });
            }
            (result, _) => result?,
        };

        tracing::info!(
            user_id = %credit.user_id,
            tokens = credit.tokens,
            tx_type = %tx_type,
            source = credit.source.as_str(),
            ref_id = %credit.ref_id,
            "Tokens credited"
        );
        Ok(CreditReceipt {
            transaction,
            replayed: false,
        })
    }

    fn replay_credit(
        &self,
        key: &str,
        tx_type: TransactionType,
        credit: &Credit,
    ) -> Result<Option<TokenTransaction>, LedgerError> {
        let Some(existing) = self.find_transaction_by_key(key)? else {
            return Ok(None);
        };
        if existing.tx_type != tx_type {
            return Err(conflict(key, "already used for a different operation"));
        }
        if existing.amount_tokens != credit.tokens || existing.user_id != credit.user_id {
            return Err(conflict(key, "reused with different credit amount"));
        }
        Ok(Some(existing))
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Current balance; zeros for a user with no row.
    pub fn get_balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        Ok(self
            .balances
            .get(user_id)?
            .unwrap_or_else(|| Balance::empty(user_id)))
    }

    /// Most recent transactions for a user, newest first.
    pub fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<TokenTransaction>, LedgerError> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, tx_type, source, amount_tokens, ref_id, idempotency_key,
                        balance_after_available, balance_after_reserved, metadata, created_at
                 FROM token_transactions WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![user_id, limit], transaction_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_reservation(&self, reservation_id: &str) -> Result<Option<Reservation>, LedgerError> {
        self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, user_id, ref_id, estimated_tokens, committed_tokens, state, expires_at, created_at
                     FROM reservations WHERE id = ?1",
                    params![reservation_id],
                    reservation_from_row,
                )
                .optional()?)
        })
    }

    /// ACTIVE reservations whose deadline is before `now`, oldest first.
    pub fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, LedgerError> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, ref_id, estimated_tokens, committed_tokens, state, expires_at, created_at
                 FROM reservations WHERE state = 'ACTIVE' AND expires_at < ?1
                 ORDER BY expires_at ASC LIMIT ?2",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![to_millis(now), limit], reservation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn find_transaction_by_key(&self, key: &str) -> Result<Option<TokenTransaction>, LedgerError> {
        self.db.read(|conn| select_transaction_by_key(conn, key))
    }
}

/// Settlement results that can be rebuilt from a replayed transaction.
trait Settled: Sized {
    fn from_replay(ledger: &TokenLedger, transaction: TokenTransaction) -> Result<Self, LedgerError>;
}

impl Settled for TokenTransaction {
    fn from_replay(_ledger: &TokenLedger, transaction: TokenTransaction) -> Result<Self, LedgerError> {
        Ok(transaction)
    }
}

impl Settled for (TokenTransaction, Balance) {
    fn from_replay(ledger: &TokenLedger, transaction: TokenTransaction) -> Result<Self, LedgerError> {
        let balance = ledger.get_balance(&transaction.user_id)?;
        Ok((transaction, balance))
    }
}

fn conflict(key: &str, reason: &'static str) -> LedgerError {
    LedgerError::IdempotencyConflict {
        key: key.to_string(),
        reason,
    }
}

fn validate_user_id(user_id: &str) -> Result<(), LedgerError> {
    if user_id.trim().is_empty() {
        return Err(LedgerError::InvalidArgument("user id cannot be empty".into()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(LedgerError::InvalidArgument(format!(
            "user id too long (max {MAX_USER_ID_LEN} characters)"
        )));
    }
    Ok(())
}

fn insert_reservation(conn: &Connection, reservation: &Reservation) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO reservations (id, user_id, ref_id, estimated_tokens, committed_tokens, state, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            reservation.id,
            reservation.user_id,
            reservation.ref_id,
            reservation.estimated_tokens,
            reservation.committed_tokens,
            reservation.state.as_str(),
            to_millis(reservation.expires_at),
            to_millis(reservation.created_at),
        ],
    )
    .map_err(|e| unique_race(e, "reservations.id"))?;
    Ok(())
}

/// Move an ACTIVE reservation to a terminal state.
fn transition_reservation(
    conn: &Connection,
    reservation: &Reservation,
    state: ReservationState,
    committed_tokens: Option<i64>,
) -> Result<(), LedgerError> {
    let updated = conn.execute(
        "UPDATE reservations SET state = ?1, committed_tokens = ?2
         WHERE id = ?3 AND state = 'ACTIVE'",
        params![state.as_str(), committed_tokens, reservation.id],
    )?;
    if updated == 0 {
        let current: String = conn.query_row(
            "SELECT state FROM reservations WHERE id = ?1",
            params![reservation.id],
            |row| row.get(0),
        )?;
        return Err(LedgerError::ReservationNotActive {
            id: reservation.id.clone(),
            state: current.parse().map_err(LedgerError::InvariantViolation)?,
        });
    }
    Ok(())
}

fn insert_transaction(conn: &Connection, transaction: &TokenTransaction) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO token_transactions (
            id, user_id, tx_type, source, amount_tokens, ref_id, idempotency_key,
            balance_after_available, balance_after_reserved, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            transaction.id,
            transaction.user_id,
            transaction.tx_type.as_str(),
            transaction.source.as_str(),
            transaction.amount_tokens,
            transaction.ref_id,
            transaction.idempotency_key,
            transaction.balance_after_available,
            transaction.balance_after_reserved,
            transaction.metadata,
            to_millis(transaction.created_at),
        ],
    )
    .map_err(|e| unique_race(e, IDEMPOTENCY_CONSTRAINT))?;
    Ok(())
}

fn select_transaction_by_key(
    conn: &Connection,
    key: &str,
) -> Result<Option<TokenTransaction>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, tx_type, source, amount_tokens, ref_id, idempotency_key,
                    balance_after_available, balance_after_reserved, metadata, created_at
             FROM token_transactions WHERE idempotency_key = ?1",
            params![key],
            transaction_from_row,
        )
        .optional()?)
}

fn reservation_from_row(row: &Row<'_>) -> rusqlite::Result<Reservation> {
    let state: String = row.get(5)?;
    Ok(Reservation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        ref_id: row.get(2)?,
        estimated_tokens: row.get(3)?,
        committed_tokens: row.get(4)?,
        state: parse_column(5, &state)?,
        expires_at: from_millis(row.get(6)?),
        created_at: from_millis(row.get(7)?),
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<TokenTransaction> {
    let tx_type: String = row.get(2)?;
    let source: String = row.get(3)?;
    Ok(TokenTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        tx_type: parse_column(2, &tx_type)?,
        source: parse_column(3, &source)?,
        amount_tokens: row.get(4)?,
        ref_id: row.get(5)?,
        idempotency_key: row.get(6)?,
        balance_after_available: row.get(7)?,
        balance_after_reserved: row.get(8)?,
        metadata: row.get(9)?,
        created_at: from_millis(row.get(10)?),
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn make_ledger() -> (TempDir, TokenLedger) {
        make_ledger_with(LedgerConfig::default())
    }

    fn make_ledger_with(config: LedgerConfig) -> (TempDir, TokenLedger) {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&tmp.path().join("ledger.db")).unwrap());
        let balances = Arc::new(BalanceStore::new(Arc::clone(&db)));
        let ledger = TokenLedger::new(db, balances, &config);
        (tmp, ledger)
    }

    fn fund(ledger: &TokenLedger, user_id: &str, tokens: i64) {
        ledger
            .credit_purchase(Credit::new(user_id, tokens, "seed"))
            .unwrap();
    }

    #[test]
    fn reserve_moves_available_to_reserved() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);

        let reservation = ledger.reserve("alice", 300, "job-1", None).unwrap();
        assert_eq!(reservation.state, ReservationState::Active);
        assert_eq!(reservation.estimated_tokens, 300);
        assert!(reservation.expires_at > reservation.created_at);

        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.available_tokens, 700);
        assert_eq!(balance.reserved_tokens, 300);

        let txs = ledger.list_transactions("alice", 10).unwrap();
        assert_eq!(txs[0].tx_type, TransactionType::Reserve);
        assert_eq!(txs[0].amount_tokens, 0);
        assert_eq!(txs[0].ref_id, reservation.id);
        assert_eq!(txs[0].balance_after_reserved, 300);
    }

    #[test]
    fn reserve_rejects_non_positive_amount() {
        let (_tmp, ledger) = make_ledger();
        let err = ledger.reserve("alice", 0, "job-1", None).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)));
        assert!(ledger.get_balance("alice").unwrap().version == 0);
    }

    #[test]
    fn reserve_rejects_empty_user() {
        let (_tmp, ledger) = make_ledger();
        let err = ledger.reserve("  ", 10, "job-1", None).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)));
    }

    #[test]
    fn insufficient_tokens_leaves_balance_untouched() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 100);
        let before = ledger.get_balance("alice").unwrap();

        let err = ledger.reserve("alice", 250, "job-1", Some("k1")).unwrap_err();
        match err {
            LedgerError::InsufficientTokens {
                estimated,
                available,
                shortfall,
                ttl_deadline,
            } => {
                assert_eq!(estimated, 250);
                assert_eq!(available, 100);
                assert_eq!(shortfall, 150);
                assert!(ttl_deadline > Utc::now());
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(ledger.get_balance("alice").unwrap(), before);
        assert_eq!(ledger.list_transactions("alice", 10).unwrap().len(), 1);
        assert!(ledger.find_transaction_by_key("k1").unwrap().is_none());
    }

    #[test]
    fn first_reservation_creates_zero_balance() {
        let (_tmp, ledger) = make_ledger();
        let err = ledger.reserve("newcomer", 1, "job-1", None).unwrap_err();
        assert_eq!(err.shortfall(), Some(1));

        let balance = ledger.get_balance("newcomer").unwrap();
        assert_eq!(balance.total(), 0);
    }

    #[test]
    fn reserve_is_idempotent_under_same_key() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);

        let first = ledger.reserve("alice", 400, "job-1", Some("req-1")).unwrap();
        let second = ledger.reserve("alice", 400, "job-1", Some("req-1")).unwrap();
        assert_eq!(first.id, second.id);

        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.available_tokens, 600);
        assert_eq!(balance.reserved_tokens, 400);
    }

    #[test]
    fn reserve_key_reuse_with_different_amount_conflicts() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        ledger.reserve("alice", 400, "job-1", Some("req-1")).unwrap();

        let err = ledger.reserve("alice", 500, "job-1", Some("req-1")).unwrap_err();
        assert!(err.to_string().contains("different reservation amount"));
    }

    #[test]
    fn reserve_key_reused_from_other_operation_conflicts() {
        let (_tmp, ledger) = make_ledger();
        ledger
            .credit_purchase(Credit::new("alice", 1_000, "pay-1").idempotency_key("shared"))
            .unwrap();

        let err = ledger.reserve("alice", 10, "job-1", Some("shared")).unwrap_err();
        assert!(err.to_string().contains("different operation"));
    }

    #[test]
    fn race_after_lookup_recovers_existing_reservation() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let winner = ledger.reserve("alice", 300, "job-1", Some("req-1")).unwrap();

        // A second request that passed the key lookup before the winner committed.
        let loser = ledger
            .reserve_new("alice", 300, "job-1", Some("req-1"))
            .unwrap();
        assert_eq!(loser.id, winner.id);

        // The losing write rolled back entirely.
        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.available_tokens, 700);
        assert_eq!(balance.reserved_tokens, 300);
    }

    #[test]
    fn race_after_lookup_recovers_when_winner_spent_the_balance() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 300);
        let winner = ledger.reserve("alice", 300, "job-1", Some("req-1")).unwrap();

        let loser = ledger
            .reserve_new("alice", 300, "job-1", Some("req-1"))
            .unwrap();
        assert_eq!(loser.id, winner.id);

        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.available_tokens, 0);
        assert_eq!(balance.reserved_tokens, 300);
    }

    #[test]
    fn insufficient_tokens_without_matching_key_still_fails() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 300);
        ledger.reserve("alice", 300, "job-1", Some("req-1")).unwrap();

        let err = ledger
            .reserve_new("alice", 300, "job-2", Some("req-2"))
            .unwrap_err();
        assert_eq!(err.shortfall(), Some(300));
    }

    /// A settle call that passed its key lookup before a concurrent request
    /// with the same key committed.
    fn settle_after_lookup(
        ledger: &TokenLedger,
        reservation_id: &str,
        tx_type: TransactionType,
        key: &str,
    ) -> Result<TokenTransaction, LedgerError> {
        match tx_type {
            TransactionType::Commit => {
                let result = ledger
                    .lock_retry
                    .run(|_| ledger.try_commit(reservation_id, 80, Some(key)));
                ledger.recover_settlement(result, Some(key), tx_type, reservation_id, Some(80))
            }
            _ => {
                let result = ledger
                    .lock_retry
                    .run(|_| ledger.try_release(reservation_id, Some(key), "released"));
                ledger
                    .recover_settlement(result, Some(key), tx_type, reservation_id, None)
                    .map(|(transaction, _)| transaction)
            }
        }
    }

    #[test]
    fn commit_race_after_lookup_returns_winning_transaction() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 100, "job-1", None).unwrap();
        let winner = ledger.commit(&reservation.id, 80, Some("c-1")).unwrap();

        let loser =
            settle_after_lookup(&ledger, &reservation.id, TransactionType::Commit, "c-1").unwrap();
        assert_eq!(loser.id, winner.id);
        assert_eq!(ledger.get_balance("alice").unwrap().available_tokens, 920);
    }

    #[test]
    fn release_race_after_lookup_returns_winning_transaction() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 100, "job-1", None).unwrap();
        let winner = ledger.release(&reservation.id, Some("r-1")).unwrap();

        let loser =
            settle_after_lookup(&ledger, &reservation.id, TransactionType::Release, "r-1").unwrap();
        assert_eq!(loser.id, winner.id);
        assert_eq!(ledger.get_balance("alice").unwrap().available_tokens, 1_000);
    }

    #[test]
    fn settled_reservation_with_other_key_is_not_active() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 100, "job-1", None).unwrap();
        ledger.commit(&reservation.id, 80, Some("c-1")).unwrap();

        let err =
            settle_after_lookup(&ledger, &reservation.id, TransactionType::Commit, "c-2").unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ReservationNotActive {
                state: ReservationState::Committed,
                ..
            }
        ));
    }

    #[test]
    fn concurrent_reserves_with_same_key_and_exact_funding() {
        let (_tmp, ledger) = make_ledger();
        let ledger = Arc::new(ledger);
        fund(&ledger, "alice", 250);

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.reserve("alice", 250, "job-1", Some("same-key"))
                })
            })
            .collect();

        let ids: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().id)
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.available_tokens, 0);
        assert_eq!(balance.reserved_tokens, 250);
    }

    #[test]
    fn concurrent_reserves_with_same_key_create_one_reservation() {
        let (_tmp, ledger) = make_ledger();
        let ledger = Arc::new(ledger);
        fund(&ledger, "alice", 10_000);

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.reserve("alice", 250, "job-1", Some("same-key"))
                })
            })
            .collect();

        let ids: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().id)
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.available_tokens, 9_750);
        assert_eq!(balance.reserved_tokens, 250);
    }

    #[test]
    fn concurrent_reserves_without_key_never_overdraw() {
        let (_tmp, ledger) = make_ledger_with(LedgerConfig {
            max_lock_attempts: 50,
            ..LedgerConfig::default()
        });
        let ledger = Arc::new(ledger);
        fund(&ledger, "alice", 1_000);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.reserve("alice", 300, &format!("job-{i}"), None))
            })
            .collect();

        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();
        assert!(succeeded <= 3);

        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.total(), 1_000);
        assert_eq!(balance.reserved_tokens, 300 * i64::try_from(succeeded).unwrap());
    }

    #[test]
    fn commit_with_exact_amount_clears_reserved() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let before = ledger.get_balance("alice").unwrap();

        let reservation = ledger.reserve("alice", 400, "job-1", None).unwrap();
        let commit = ledger.commit(&reservation.id, 400, None).unwrap();
        assert_eq!(commit.tx_type, TransactionType::Commit);
        assert_eq!(commit.amount_tokens, 400);

        let after = ledger.get_balance("alice").unwrap();
        assert_eq!(after.available_tokens, before.available_tokens - 400);
        assert_eq!(after.reserved_tokens, before.reserved_tokens);

        let stored = ledger.get_reservation(&reservation.id).unwrap().unwrap();
        assert_eq!(stored.state, ReservationState::Committed);
        assert_eq!(stored.committed_tokens, Some(400));
    }

    #[test]
    fn commit_under_estimate_returns_difference() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 400, "job-1", None).unwrap();

        ledger.commit(&reservation.id, 150, None).unwrap();

        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.available_tokens, 850);
        assert_eq!(balance.reserved_tokens, 0);
    }

    #[test]
    fn commit_over_estimate_draws_from_available() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 400, "job-1", None).unwrap();

        ledger.commit(&reservation.id, 500, None).unwrap();

        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.available_tokens, 500);
        assert_eq!(balance.reserved_tokens, 0);
    }

    #[test]
    fn commit_overrun_beyond_available_fails_without_writes() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 500);
        let reservation = ledger.reserve("alice", 400, "job-1", None).unwrap();

        let err = ledger.commit(&reservation.id, 700, None).unwrap_err();
        match err {
            LedgerError::InsufficientTokens {
                estimated,
                available,
                shortfall,
                ..
            } => {
                assert_eq!(estimated, 300);
                assert_eq!(available, 100);
                assert_eq!(shortfall, 200);
            }
            other => panic!("unexpected error: {other}"),
        }

        let stored = ledger.get_reservation(&reservation.id).unwrap().unwrap();
        assert_eq!(stored.state, ReservationState::Active);
        assert_eq!(ledger.get_balance("alice").unwrap().reserved_tokens, 400);
    }

    #[test]
    fn commit_terminal_reservation_is_an_error() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 100, "job-1", None).unwrap();
        ledger.commit(&reservation.id, 100, None).unwrap();

        let err = ledger.commit(&reservation.id, 100, None).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ReservationNotActive {
                state: ReservationState::Committed,
                ..
            }
        ));
        assert!(ledger.release(&reservation.id, None).is_err());
        assert_eq!(ledger.get_balance("alice").unwrap().available_tokens, 900);
    }

    #[test]
    fn commit_replay_with_key_returns_original() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 100, "job-1", None).unwrap();

        let first = ledger.commit(&reservation.id, 80, Some("commit-1")).unwrap();
        let second = ledger.commit(&reservation.id, 80, Some("commit-1")).unwrap();
        assert_eq!(first.id, second.id);

        let err = ledger.commit(&reservation.id, 90, Some("commit-1")).unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));
    }

    #[test]
    fn commit_unknown_reservation_fails() {
        let (_tmp, ledger) = make_ledger();
        let err = ledger.commit("missing", 10, None).unwrap_err();
        assert!(matches!(err, LedgerError::ReservationNotFound(_)));
    }

    #[test]
    fn release_restores_full_estimate() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 400, "job-1", None).unwrap();

        let release = ledger.release(&reservation.id, Some("rel-1")).unwrap();
        assert_eq!(release.tx_type, TransactionType::Release);
        assert_eq!(release.amount_tokens, 400);

        let balance = ledger.get_balance("alice").unwrap();
        assert_eq!(balance.available_tokens, 1_000);
        assert_eq!(balance.reserved_tokens, 0);

        let again = ledger.release(&reservation.id, Some("rel-1")).unwrap();
        assert_eq!(again.id, release.id);
        assert_eq!(
            ledger.get_reservation(&reservation.id).unwrap().unwrap().state,
            ReservationState::Released
        );
    }

    #[test]
    fn credit_purchase_is_idempotent_by_key() {
        let (_tmp, ledger) = make_ledger();
        let credit = Credit::new("alice", 500, "pay-1")
            .idempotency_key("payment:pay-1")
            .source(TransactionSource::PaymentWebhook);

        let first = ledger.credit_purchase(credit.clone()).unwrap();
        let second = ledger.credit_purchase(credit).unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.transaction.id, second.transaction.id);
        assert_eq!(ledger.get_balance("alice").unwrap().available_tokens, 500);
    }

    #[test]
    fn credit_key_reused_for_refund_conflicts() {
        let (_tmp, ledger) = make_ledger();
        ledger
            .credit_purchase(Credit::new("alice", 500, "pay-1").idempotency_key("k"))
            .unwrap();
        let err = ledger
            .credit_refund(Credit::new("alice", 500, "pay-1").idempotency_key("k"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));
    }

    #[test]
    fn credit_refund_records_refund_type() {
        let (_tmp, ledger) = make_ledger();
        let receipt = ledger
            .credit_refund(
                Credit::new("alice", 120, "pay-1")
                    .source(TransactionSource::PaymentWebhook)
                    .metadata(&serde_json::json!({"disputeId": "dp_1"})),
            )
            .unwrap();
        assert_eq!(receipt.transaction.tx_type, TransactionType::Refund);
        assert_eq!(
            receipt.transaction.metadata_json().unwrap()["disputeId"],
            "dp_1"
        );
    }

    #[test]
    fn credit_rejects_non_positive_tokens() {
        let (_tmp, ledger) = make_ledger();
        assert!(ledger.credit_purchase(Credit::new("alice", 0, "x")).is_err());
        assert!(ledger.credit_purchase(Credit::new("alice", -5, "x")).is_err());
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refusing to serialize"))
        }
    }

    #[test]
    fn metadata_failure_does_not_abort_credit() {
        let (_tmp, ledger) = make_ledger();
        let receipt = ledger
            .credit_purchase(Credit::new("alice", 10, "pay-1").metadata(&Unserializable))
            .unwrap();
        assert!(receipt.transaction.metadata.is_none());
        assert_eq!(ledger.get_balance("alice").unwrap().available_tokens, 10);
    }

    #[test]
    fn expired_reservations_lists_only_active_past_deadline() {
        let (_tmp, ledger) = make_ledger_with(LedgerConfig {
            reservation_ttl_secs: 60,
            ..LedgerConfig::default()
        });
        fund(&ledger, "alice", 1_000);
        let stale = ledger.reserve("alice", 100, "job-1", None).unwrap();
        let committed = ledger.reserve("alice", 100, "job-2", None).unwrap();
        ledger.commit(&committed.id, 100, None).unwrap();

        assert!(ledger.expired_reservations(Utc::now(), 10).unwrap().is_empty());

        let later = Utc::now() + TimeDelta::minutes(5);
        let expired = ledger.expired_reservations(later, 10).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
        assert!(expired[0].is_expired(later));
    }

    #[test]
    fn release_expired_returns_post_update_balance() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 250, "job-1", None).unwrap();

        let (transaction, balance) = ledger.release_expired(&reservation.id).unwrap();
        assert_eq!(transaction.source, TransactionSource::JobBilling);
        assert_eq!(transaction.metadata_json().unwrap()["reason"], "expired");
        assert_eq!(balance.available_tokens, 1_000);
        assert_eq!(balance.reserved_tokens, 0);
    }

    #[test]
    fn list_transactions_newest_first_with_limit() {
        let (_tmp, ledger) = make_ledger();
        fund(&ledger, "alice", 1_000);
        let reservation = ledger.reserve("alice", 100, "job-1", None).unwrap();
        ledger.release(&reservation.id, None).unwrap();

        let txs = ledger.list_transactions("alice", 2).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].tx_type, TransactionType::Release);
        assert_eq!(txs[1].tx_type, TransactionType::Reserve);
        assert!(ledger.list_transactions("nobody", 10).unwrap().is_empty());
    }

    #[test]
    fn state_and_type_strings_parse_back() {
        for state in [
            ReservationState::Active,
            ReservationState::Committed,
            ReservationState::Released,
        ] {
            assert_eq!(state.as_str().parse::<ReservationState>().unwrap(), state);
        }
        assert!("PENDING".parse::<ReservationState>().is_err());
        assert_eq!("REFUND".parse::<TransactionType>().unwrap(), TransactionType::Refund);
    }
}
