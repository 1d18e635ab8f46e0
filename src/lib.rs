//! Token ledger with reservation lifecycle and payment webhook reconciliation.
//!
//! ## Layout
//! - [`billing`]: balances, reservations, the append-only transaction log,
//!   payment records and the expiry sweeper
//! - [`webhook`]: signature verification and event reconciliation into the ledger
//! - [`config`]: TOML configuration
//! - [`observability`]: logging bootstrap and the metrics sink

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod billing;
pub mod config;
pub mod observability;
pub mod webhook;

pub use billing::{
    Balance, BalanceStore, Credit, CreditReceipt, Database, ExpirySweeper, LedgerError,
    PaymentEventStore, Reservation, ReservationState, TokenLedger, TokenTransaction,
    TransactionType,
};
pub use config::Config;
pub use observability::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use webhook::{WebhookOutcome, WebhookReconciler};
