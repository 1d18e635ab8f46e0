//! Token billing: balances, reservations, the transaction log and payments.
//!
//! ## Design
//! - SQLite-based local ledger (one database, one connection behind a mutex)
//! - Reserve → commit | release lifecycle over per-user available/reserved counters
//! - Optimistic versioning on balances with a bounded retry
//! - Request idempotency through a unique `idempotency_key` on transactions
//! - Background sweeper reclaiming reservations past their TTL

pub mod balance;
pub mod db;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod payment;
pub mod retry;
pub mod sweeper;

pub use balance::{Balance, BalanceStore};
pub use db::Database;
pub use error::LedgerError;
pub use jobs::{InMemoryJobRecords, JobBillingState, JobRecord, JobRecords, NoJobRecords};
pub use ledger::{
    audit_metadata, Credit, CreditReceipt, Metadata, Reservation, ReservationState, TokenLedger,
    TokenTransaction, TransactionSource, TransactionType,
};
pub use payment::{Payment, PaymentEventStore, PaymentStatus};
pub use retry::LockRetry;
pub use sweeper::{ExpirySweeper, SweepReport};
