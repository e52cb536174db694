// In-process job leases serializing dispatch and control operations per job

use crate::errors::SchedulerError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Table of per-job leases
///
/// At most one holder per job at a time. Jobs never leased have no entry.
#[derive(Debug, Default)]
pub struct LeaseTable {
    slots: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, job_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(job_id).or_default().clone()
    }

    /// Wait up to `timeout` for exclusive access to `job_id`
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn acquire(&self, job_id: Uuid, timeout: Duration) -> Result<JobLease, SchedulerError> {
        let slot = self.slot(job_id);

        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => {
                debug!("Lease acquired");
                Ok(JobLease {
                    job_id,
                    _guard: guard,
                    acquired_at: Instant::now(),
                })
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Lease not acquired within timeout"
                );
                Err(SchedulerError::LeaseUnavailable(job_id))
            }
        }
    }

    /// Whether someone currently holds the lease for `job_id`
    pub fn is_held(&self, job_id: Uuid) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&job_id)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop the entry for `job_id` when nobody holds or waits on it
    pub fn forget(&self, job_id: Uuid) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots
            .get(&job_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&job_id);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one job; released when dropped
#[derive(Debug)]
pub struct JobLease {
    job_id: Uuid,
    _guard: OwnedMutexGuard<()>,
    acquired_at: Instant,
}

impl JobLease {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        debug!(
            job_id = %self.job_id,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Lease released"
        );
    }
}
