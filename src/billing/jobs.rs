//! Contract with the application records that own reservations.
//!
//! The ledger does not know what a job is. The sweeper only needs to find
//! the record holding a reservation and move its billing state from
//! RESERVED to RELEASED.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobBillingState {
    Reserved,
    Committed,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: String,
    pub reservation_id: String,
    pub billing_state: JobBillingState,
}

/// Application-side store of records that hold reservations.
pub trait JobRecords: Send + Sync {
    fn find_by_reservation(&self, reservation_id: &str) -> anyhow::Result<Option<JobRecord>>;

    fn set_billing_state(&self, job_id: &str, state: JobBillingState) -> anyhow::Result<()>;
}

/// For deployments with no owning records.
pub struct NoJobRecords;

impl JobRecords for NoJobRecords {
    fn find_by_reservation(&self, _reservation_id: &str) -> anyhow::Result<Option<JobRecord>> {
        Ok(None)
    }

    fn set_billing_state(&self, job_id: &str, _state: JobBillingState) -> anyhow::Result<()> {
        anyhow::bail!("No job records configured, cannot update {job_id}")
    }
}

/// Process-local job records keyed by job id.
#[derive(Default)]
pub struct InMemoryJobRecords {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl InMemoryJobRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: JobRecord) {
        self.jobs.lock().insert(record.job_id.clone(), record);
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.lock().get(job_id).cloned()
    }
}

impl JobRecords for InMemoryJobRecords {
    fn find_by_reservation(&self, reservation_id: &str) -> anyhow::Result<Option<JobRecord>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .find(|j| j.reservation_id == reservation_id)
            .cloned())
    }

    fn set_billing_state(&self, job_id: &str, state: JobBillingState) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow::anyhow!("Job not found: {job_id}"))?;
        job.billing_state = state;
        Ok(())
    }
}
