//! Periodic reclamation of ACTIVE reservations whose TTL elapsed.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::error::LedgerError;
use super::jobs::{JobBillingState, JobRecords};
use super::ledger::{Reservation, TokenLedger};
use crate::observability::MetricsSink;

/// Outcome of one sweeper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired reservations found this pass.
    pub expired: usize,
    pub released: usize,
    /// Reservations settled by someone else between query and release.
    pub already_settled: usize,
    pub failed: usize,
    pub tokens_released: i64,
    /// True when another pass was still running and this one did nothing.
    pub skipped: bool,
}

pub struct ExpirySweeper {
    ledger: Arc<TokenLedger>,
    jobs: Arc<dyn JobRecords>,
    metrics: Arc<dyn MetricsSink>,
    batch_limit: usize,
    running: AtomicBool,
}

impl ExpirySweeper {
    pub fn new(
        ledger: Arc<TokenLedger>,
        jobs: Arc<dyn JobRecords>,
        metrics: Arc<dyn MetricsSink>,
        batch_limit: usize,
    ) -> Self {
        Self {
            ledger,
            jobs,
            metrics,
            batch_limit: batch_limit.max(1),
            running: AtomicBool::new(false),
        }
    }

    pub fn run_once(&self) -> Result<SweepReport, LedgerError> {
        self.run_at(Utc::now())
    }

    /// Release every reservation that expired before `now`.
    ///
    /// Each reservation is handled independently; one failure does not stop
    /// the batch. Only the initial query can fail the pass.
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<SweepReport, LedgerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Expiry sweep already running, skipping");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }

        let result = self.sweep(now);
        self.running.store(false, Ordering::Release);
        result
    }

    fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, LedgerError> {
        let expired = self.ledger.expired_reservations(now, self.batch_limit)?;
        let mut report = SweepReport {
            expired: expired.len(),
            ..SweepReport::default()
        };

        for reservation in &expired {
            match self.ledger.release_expired(&reservation.id) {
                Ok((_, balance)) => {
                    report.released += 1;
                    report.tokens_released += reservation.estimated_tokens;
                    self.metrics.tokens_released(reservation.estimated_tokens);
                    self.metrics.reservation_released();
                    self.metrics
                        .balance(&balance.user_id, balance.available_tokens, balance.reserved_tokens);
                    self.release_job(reservation);
                }
                Err(LedgerError::ReservationNotActive { state, .. }) => {
                    tracing::debug!(
                        reservation_id = %reservation.id,
                        %state,
                        "Reservation settled before expiry release"
                    );
                    report.already_settled += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        reservation_id = %reservation.id,
                        user_id = %reservation.user_id,
                        "Failed to release expired reservation: {e}"
                    );
                    report.failed += 1;
                }
            }
        }

        self.metrics.sweeper_backlog(report.expired);
        if report.expired > 0 {
            tracing::info!(
                expired = report.expired,
                released = report.released,
                failed = report.failed,
                tokens = report.tokens_released,
                "Expired reservations swept"
            );
        }
        Ok(report)
    }

    fn release_job(&self, reservation: &Reservation) {
        let job = match self.jobs.find_by_reservation(&reservation.id) {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(reservation_id = %reservation.id, "Job lookup failed: {e:#}");
                return;
            }
        };
        if job.billing_state != JobBillingState::Reserved {
            return;
        }
        if let Err(e) = self
            .jobs
            .set_billing_state(&job.job_id, JobBillingState::Released)
        {
            tracing::warn!(job_id = %job.job_id, "Failed to mark job billing released: {e:#}");
        }
    }

    /// Run a pass every `period` on the tokio runtime until the handle is aborted.
    pub fn spawn(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let sweeper = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || sweeper.run_once()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("Expiry sweep failed: {e}"),
                    Err(e) => tracing::error!("Expiry sweep task panicked: {e}"),
                }
            }
        })
    }
}
