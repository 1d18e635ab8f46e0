use chrono::{DateTime, Utc};

use super::ledger::ReservationState;
use crate::webhook::provider::ProviderError;

/// Every failure the ledger and the webhook reconciler can surface.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Bad caller input; nothing was written.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Not enough available tokens; nothing was written.
    #[error("insufficient tokens: estimated {estimated}, available {available}, shortfall {shortfall}")]
    InsufficientTokens {
        estimated: i64,
        available: i64,
        shortfall: i64,
        /// Deadline by which tokens currently held by reservations are
        /// committed or reclaimed.
        ttl_deadline: DateTime<Utc>,
    },

    #[error("idempotency key {key} {reason}")]
    IdempotencyConflict { key: String, reason: &'static str },

    #[error("reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("reservation {id} is {state}, not ACTIVE")]
    ReservationNotActive { id: String, state: ReservationState },

    #[error("invalid checkout session: {0}")]
    InvalidCheckoutSession(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(&'static str),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Balance row changed between read and write.
    #[error("optimistic lock conflict on balance of {user_id}")]
    OptimisticLockConflict { user_id: String },

    /// Concurrent insert hit a uniqueness constraint; recovered by re-reading.
    #[error("unique constraint race on {constraint}")]
    UniqueConstraintRace { constraint: &'static str },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("payment provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("collaborator error: {0:#}")]
    Collaborator(#[from] anyhow::Error),
}

impl LedgerError {
    /// Shortfall carried by `InsufficientTokens`.
    pub fn shortfall(&self) -> Option<i64> {
        match self {
            Self::InsufficientTokens { shortfall, .. } => Some(*shortfall),
            _ => None,
        }
    }

    /// True for errors a caller should fix rather than retry.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::InsufficientTokens { .. }
                | Self::IdempotencyConflict { .. }
                | Self::InvalidCheckoutSession(_)
                | Self::ReservationNotFound(_)
                | Self::ReservationNotActive { .. }
        )
    }
}
