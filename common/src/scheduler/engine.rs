// Scheduler engine: dispatch loop and control surface

use crate::config::{JobDefaults, SchedulerConfig, Settings};
use crate::db::repositories::execution::ExecutionRepository;
use crate::db::repositories::job::{JobRepository, ReleaseFailure};
use crate::db::DbPool;
use crate::errors::{ScheduleError, SchedulerError, SubmitError};
use crate::lease::JobLease;
use crate::models::{
    ExecutionFilter, ExecutionRecord, Job, JobFilter, JobSpec, JobStatus, JobUpdate, Trigger,
};
use crate::retry::{retry_with, ExponentialBackoff, RetryStrategy};
use crate::schedule::{ScheduleTrigger, MAX_INTERVAL_SECONDS};
use crate::scheduler::clock::{Clock, SystemClock};
use crate::scheduler::misfire::{plan_fires, FireAction, MAX_BACKLOG_FIRES};
use crate::scheduler::queue::DispatchQueue;
use crate::telemetry;
use crate::worker::pool::{Dispatch, ExecutionHandle, WorkerPool};
use crate::worker::registry::PayloadRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Observable state of the scheduler loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    IdleWaiting,
    Dispatching,
    ShuttingDown,
}

/// What one wake did
#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub submitted: usize,
    pub misfired: usize,
    /// Due entries dropped because the job changed under the loop
    pub skipped: usize,
    /// Due entries put back for the next wake after a store error
    pub failed: usize,
    pub executions: Vec<ExecutionHandle>,
}

impl DispatchSummary {
    /// Wait for every execution started by this wake
    pub async fn wait_all(self) -> Vec<ExecutionRecord> {
        let mut records = Vec::with_capacity(self.executions.len());
        for handle in self.executions {
            if let Some(record) = handle.wait().await {
                records.push(record);
            }
        }
        records
    }
}

/// A write-back that ran out of retries; retried on the next wake
struct StalledWriteback {
    lease: JobLease,
    next_fire_time: Option<DateTime<Utc>>,
    status: JobStatus,
}

/// A misfire record the store refused; retried on the next wake
struct ParkedMisfire {
    job_id: Uuid,
    fire_time: DateTime<Utc>,
    decided_at: DateTime<Utc>,
    reason: String,
}

struct SchedulerCore {
    config: SchedulerConfig,
    defaults: JobDefaults,
    jobs: JobRepository,
    executions: ExecutionRepository,
    pool: WorkerPool,
    clock: Arc<dyn Clock>,
    backoff: ExponentialBackoff,
    queue: Mutex<DispatchQueue>,
    stalled: Mutex<Vec<StalledWriteback>>,
    parked_misfires: Mutex<Vec<ParkedMisfire>>,
    /// Set when the last wake put entries back after a store error
    retry_due: AtomicBool,
    dispatch_gate: AsyncMutex<()>,
    state: Mutex<LoopState>,
    control: Notify,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

/// Scheduler owns the dispatch loop and exposes the control operations
///
/// Cloning gives another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// Create a scheduler over `db` driven by the wall clock
    pub fn new(db: DbPool, settings: &Settings, registry: Arc<PayloadRegistry>) -> Self {
        Self::with_clock(db, settings, registry, Arc::new(SystemClock))
    }

    /// Create a scheduler with an explicit time source
    pub fn with_clock(
        db: DbPool,
        settings: &Settings,
        registry: Arc<PayloadRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let jobs = JobRepository::new(db.clone()).with_lease_timeout(settings.scheduler.lease_timeout());
        let executions = ExecutionRepository::new(db);
        let pool = WorkerPool::new(
            settings.worker.concurrency as usize,
            settings.worker.output_max_chars,
            registry,
            executions.clone(),
            clock.clone(),
        );
        let backoff = ExponentialBackoff::with_config(
            settings.scheduler.writeback_base_delay_ms,
            settings.scheduler.writeback_base_delay_ms.saturating_mul(100),
            0.1,
            settings.scheduler.writeback_attempts,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            core: Arc::new(SchedulerCore {
                config: settings.scheduler.clone(),
                defaults: settings.job_defaults.clone(),
                jobs,
                executions,
                pool,
                clock,
                backoff,
                queue: Mutex::new(DispatchQueue::new()),
                stalled: Mutex::new(Vec::new()),
                parked_misfires: Mutex::new(Vec::new()),
                retry_due: AtomicBool::new(false),
                dispatch_gate: AsyncMutex::new(()),
                state: Mutex::new(LoopState::IdleWaiting),
                control: Notify::new(),
                shutdown_tx,
                loop_handle: AsyncMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> LoopState {
        self.core.state()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.core.pool
    }

    pub fn queue_len(&self) -> usize {
        self.core.with_queue(|q| q.len())
    }

    /// Queued fire time of a job, if it is in the dispatch queue
    pub fn queued_fire_time(&self, job_id: Uuid) -> Option<DateTime<Utc>> {
        self.core.with_queue(|q| q.fire_time_of(job_id))
    }

    /// Reconcile orphaned executions and load the dispatch queue
    ///
    /// Must run before any execution of this process has started.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<(), SchedulerError> {
        let now = self.core.clock.now();

        let orphans = self.core.executions.reconcile_interrupted(now).await?;
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "Reconciled interrupted executions");
        }

        let jobs = self.core.jobs.find_schedulable().await?;
        self.core.with_queue(|queue| {
            queue.clear();
            for job in &jobs {
                if let Some(next) = job.next_fire_time {
                    queue.upsert(job.id, next);
                }
            }
        });

        info!(queued_jobs = jobs.len(), "Dispatch queue loaded");
        Ok(())
    }

    /// Restore state and spawn the dispatch loop
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut handle = self.core.loop_handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }
        if self.state() == LoopState::ShuttingDown {
            return Err(SchedulerError::ShuttingDown);
        }

        self.restore().await?;

        let core = self.core.clone();
        let shutdown_rx = self.core.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(run_loop(core, shutdown_rx)));

        info!(
            capacity = self.core.pool.capacity(),
            max_idle_wait_seconds = self.core.config.max_idle_wait_seconds,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop the loop, drain in-flight executions and flush pending write-backs
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        info!("Stopping scheduler");
        self.core.set_state(LoopState::ShuttingDown);
        let _ = self.core.shutdown_tx.send(true);

        if let Some(handle) = self.core.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler loop ended abnormally");
            }
        }

        // Waits out a wake already in progress
        let _gate = self.core.dispatch_gate.lock().await;

        self.core.pool.close();
        let drained = self.core.pool.drain(self.core.config.shutdown_timeout()).await;
        if !drained {
            warn!(
                in_flight = self.core.pool.in_flight(),
                "Shutdown timeout reached with executions still running"
            );
        }

        self.core.flush_stalled().await;
        let stalled = self.core.stalled_len();
        if stalled > 0 {
            error!(count = stalled, "Job state could not be written back before shutdown");
        }
        self.core.flush_parked_misfires().await;
        let parked = self.core.parked_misfires_len();
        if parked > 0 {
            error!(count = parked, "Misfire records lost at shutdown");
        }

        info!(drained = drained, "Scheduler stopped");
        Ok(())
    }

    /// Run one wake at `now`
    ///
    /// The background loop calls this on every wake; tests call it directly
    /// with a manual clock.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchSummary, SchedulerError> {
        self.core.dispatch_due(now).await
    }

    // ------------------------------------------------------------------
    // Control operations
    // ------------------------------------------------------------------

    /// Validate and persist a new job, returning its id
    #[instrument(skip(self, spec), fields(job_name = %spec.name, payload_ref = %spec.payload_ref))]
    pub async fn create_job(&self, spec: JobSpec) -> Result<Uuid, SchedulerError> {
        let now = self.core.clock.now();
        let defaults = &self.core.defaults;

        let job = Job {
            id: Uuid::new_v4(),
            name: spec.name,
            description: spec.description,
            payload_ref: spec.payload_ref,
            trigger: anchor_trigger(spec.trigger, now),
            args: serde_json::Value::Array(spec.args),
            kwargs: spec.kwargs,
            max_instances: spec.max_instances.unwrap_or(defaults.max_instances),
            misfire_grace_seconds: spec
                .misfire_grace_seconds
                .unwrap_or(defaults.misfire_grace_seconds),
            coalesce: spec.coalesce.unwrap_or(defaults.coalesce),
            status: JobStatus::Running,
            next_fire_time: None,
            created_at: now,
            updated_at: now,
        };
        self.core.check_definition(&job)?;

        let first = first_fire(&job.trigger, now)?;
        let job = Job {
            next_fire_time: Some(first),
            ..job
        };

        self.core.jobs.create(&job).await?;
        self.core.sync_queue(&job);

        info!(job_id = %job.id, next_fire_time = %first, "Job scheduled");
        Ok(job.id)
    }

    /// Change a job definition; in-flight executions are unaffected
    #[instrument(skip(self, update))]
    pub async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job, SchedulerError> {
        let _lease = self.core.jobs.claim_for_dispatch(id).await?;
        let mut job = self.core.live_job(id).await?;
        let now = self.core.clock.now();

        if let Some(name) = update.name {
            job.name = name;
        }
        if let Some(description) = update.description {
            job.description = Some(description);
        }
        if let Some(payload_ref) = update.payload_ref {
            job.payload_ref = payload_ref;
        }
        if let Some(args) = update.args {
            job.args = serde_json::Value::Array(args);
        }
        if let Some(kwargs) = update.kwargs {
            job.kwargs = kwargs;
        }
        if let Some(max_instances) = update.max_instances {
            job.max_instances = max_instances;
        }
        if let Some(grace) = update.misfire_grace_seconds {
            job.misfire_grace_seconds = grace;
        }
        if let Some(coalesce) = update.coalesce {
            job.coalesce = coalesce;
        }
        self.core.check_definition(&job)?;

        if let Some(trigger) = update.trigger {
            let trigger = anchor_trigger(trigger, now);
            let first = first_fire(&trigger, now)?;
            job.trigger = trigger;
            match job.status {
                JobStatus::Paused => {}
                // A new trigger re-arms finished and failed jobs
                JobStatus::Running | JobStatus::Completed | JobStatus::Error => {
                    job.status = JobStatus::Running;
                    job.next_fire_time = Some(first);
                }
                JobStatus::Removed => return Err(SchedulerError::NotFound(id)),
            }
        }

        job.updated_at = now;
        self.core.jobs.update_definition(&job).await?;
        self.core.sync_queue(&job);

        info!(job_id = %id, status = %job.status, next_fire_time = ?job.next_fire_time, "Job updated");
        Ok(job)
    }

    /// Stop future fires; running executions continue
    #[instrument(skip(self))]
    pub async fn pause_job(&self, id: Uuid) -> Result<Job, SchedulerError> {
        let _lease = self.core.jobs.claim_for_dispatch(id).await?;
        let mut job = self.core.live_job(id).await?;

        if job.status == JobStatus::Running {
            self.core.jobs.set_state(id, None, JobStatus::Paused).await?;
            job.status = JobStatus::Paused;
            job.next_fire_time = None;
            self.core.sync_queue(&job);
            info!(job_id = %id, "Job paused");
        } else {
            debug!(job_id = %id, status = %job.status, "Pause ignored");
        }
        Ok(job)
    }

    /// Re-arm a paused job from the current time
    #[instrument(skip(self))]
    pub async fn resume_job(&self, id: Uuid) -> Result<Job, SchedulerError> {
        let _lease = self.core.jobs.claim_for_dispatch(id).await?;
        let mut job = self.core.live_job(id).await?;

        if job.status != JobStatus::Paused {
            debug!(job_id = %id, status = %job.status, "Resume ignored");
            return Ok(job);
        }

        let now = self.core.clock.now();
        let (next, status) = match job.trigger.next_fire(now)? {
            Some(next) => (Some(next), JobStatus::Running),
            None => (None, JobStatus::Completed),
        };
        self.core.jobs.set_state(id, next, status).await?;
        job.next_fire_time = next;
        job.status = status;
        self.core.sync_queue(&job);

        info!(job_id = %id, status = %status, next_fire_time = ?next, "Job resumed");
        Ok(job)
    }

    /// Tombstone a job; its execution history stays queryable
    #[instrument(skip(self))]
    pub async fn remove_job(&self, id: Uuid) -> Result<(), SchedulerError> {
        {
            let _lease = self.core.jobs.claim_for_dispatch(id).await?;
            let mut job = self.core.live_job(id).await?;

            self.core.jobs.set_state(id, None, JobStatus::Removed).await?;
            job.status = JobStatus::Removed;
            job.next_fire_time = None;
            self.core.sync_queue(&job);
        }
        self.core.jobs.leases().forget(id);

        info!(job_id = %id, "Job removed");
        Ok(())
    }

    /// Start an immediate manual execution; the schedule is left untouched
    #[instrument(skip(self))]
    pub async fn run_now(&self, id: Uuid) -> Result<Uuid, SchedulerError> {
        let job = self.core.live_job(id).await?;
        let handle = self.core.pool.submit(&job, Dispatch::manual()).await?;
        info!(job_id = %id, execution_id = %handle.execution_id, "Manual run started");
        Ok(handle.execution_id)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, SchedulerError> {
        self.core
            .jobs
            .find_by_id(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.core.jobs.find_with_filter(&filter).await?)
    }

    pub async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, SchedulerError> {
        Ok(self.core.executions.find_with_filter(&filter).await?)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, SchedulerError> {
        self.core
            .executions
            .find_by_id(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Delete one finished execution record
    #[instrument(skip(self))]
    pub async fn delete_execution(&self, id: Uuid) -> Result<(), SchedulerError> {
        let record = self.get_execution(id).await?;
        if !record.is_terminal() {
            return Err(SchedulerError::ExecutionRunning(id));
        }
        // Deleted concurrently
        if !self.core.executions.delete_by_id(id).await? {
            return Err(SchedulerError::NotFound(id));
        }
        Ok(())
    }

    /// Delete the finished execution records of one job
    pub async fn delete_executions_for_job(&self, id: Uuid) -> Result<u64, SchedulerError> {
        Ok(self.core.executions.delete_for_job(id).await?)
    }

    /// Delete finished execution records that started before `cutoff`
    pub async fn purge_executions_before(&self, cutoff: DateTime<Utc>) -> Result<u64, SchedulerError> {
        Ok(self.core.executions.purge_before(cutoff).await?)
    }
}

/// Give interval triggers without an anchor one at `now + every`
fn anchor_trigger(trigger: Trigger, now: DateTime<Utc>) -> Trigger {
    match trigger {
        Trigger::Interval {
            every_seconds,
            start_date: None,
            end_date,
        } => {
            let every = ChronoDuration::seconds(every_seconds.min(MAX_INTERVAL_SECONDS) as i64);
            Trigger::Interval {
                every_seconds,
                start_date: now.checked_add_signed(every),
                end_date,
            }
        }
        other => other,
    }
}

fn first_fire(trigger: &Trigger, now: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    trigger.validate(now).map_err(|e| match e {
        ScheduleError::Exhausted => {
            SchedulerError::Configuration("trigger has no future fire time".to_string())
        }
        other => other.into(),
    })
}

impl SchedulerCore {
    fn state(&self) -> LoopState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: LoopState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // ShuttingDown is final
        if *state != LoopState::ShuttingDown {
            *state = next;
        }
    }

    fn with_queue<R>(&self, f: impl FnOnce(&mut DispatchQueue) -> R) -> R {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let result = f(&mut queue);
        telemetry::update_queue_size(queue.len());
        result
    }

    fn stalled_len(&self) -> usize {
        self.stalled.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn parked_misfires_len(&self) -> usize {
        self.parked_misfires.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Make the queue agree with a job's stored state and wake the loop
    fn sync_queue(&self, job: &Job) {
        self.with_queue(|queue| match (job.status, job.next_fire_time) {
            (JobStatus::Running, Some(next)) => queue.upsert(job.id, next),
            _ => {
                queue.remove(job.id);
            }
        });
        self.control.notify_one();
    }

    fn check_definition(&self, job: &Job) -> Result<(), SchedulerError> {
        if job.name.trim().is_empty() {
            return Err(SchedulerError::Configuration(
                "job name cannot be empty".to_string(),
            ));
        }
        if job.max_instances == 0 {
            return Err(SchedulerError::Configuration(
                "max_instances must be at least 1".to_string(),
            ));
        }
        if !self.pool.registry().contains(&job.payload_ref) {
            return Err(SchedulerError::Configuration(format!(
                "unknown payload '{}'",
                job.payload_ref
            )));
        }
        Ok(())
    }

    /// Load a job that has not been removed
    async fn live_job(&self, id: Uuid) -> Result<Job, SchedulerError> {
        match self.jobs.find_by_id(id).await? {
            Some(job) if job.status != JobStatus::Removed => Ok(job),
            _ => Err(SchedulerError::NotFound(id)),
        }
    }

    /// Time until the earliest queued fire, capped by the idle wait
    ///
    /// Parked work shortens it to the write-back retry delay; entries put
    /// back after a store error are not retried sooner than that delay.
    fn next_wait(&self) -> Duration {
        let cap = self.config.max_idle_wait();
        let retry = cap.min(Duration::from_millis(self.config.writeback_base_delay_ms.max(1)));
        if self.stalled_len() + self.parked_misfires_len() > 0 {
            return retry;
        }

        let now = self.clock.now();
        let wait = self.with_queue(|queue| match queue.peek_earliest() {
            Some((fire_time, _)) => (fire_time - now).to_std().unwrap_or(Duration::ZERO).min(cap),
            None => cap,
        });
        if self.retry_due.load(Ordering::SeqCst) {
            wait.max(retry)
        } else {
            wait
        }
    }

    async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchSummary, SchedulerError> {
        let _gate = self.dispatch_gate.lock().await;
        if self.state() == LoopState::ShuttingDown {
            return Err(SchedulerError::ShuttingDown);
        }
        self.set_state(LoopState::Dispatching);

        self.flush_stalled().await;
        self.flush_parked_misfires().await;

        let due = self.with_queue(|queue| queue.pop_due(now));
        let mut summary = DispatchSummary::default();

        for (fire_time, job_id) in due {
            if let Err(e) = self.dispatch_job(job_id, fire_time, now, &mut summary).await {
                error!(job_id = %job_id, error = %e, "Failed to dispatch job, kept for next wake");
                self.requeue(job_id, fire_time);
                summary.failed += 1;
            }
        }
        self.retry_due.store(summary.failed > 0, Ordering::SeqCst);

        if summary.submitted + summary.misfired + summary.failed > 0 {
            info!(
                submitted = summary.submitted,
                misfired = summary.misfired,
                skipped = summary.skipped,
                failed = summary.failed,
                "Dispatched due jobs"
            );
        }

        self.set_state(LoopState::IdleWaiting);
        Ok(summary)
    }

    /// Put a popped entry back unless the queue already holds a newer one
    fn requeue(&self, job_id: Uuid, fire_time: DateTime<Utc>) {
        self.with_queue(|queue| {
            if !queue.contains(job_id) {
                queue.upsert(job_id, fire_time);
            }
        });
    }

    #[instrument(skip(self, summary))]
    async fn dispatch_job(
        &self,
        job_id: Uuid,
        queued_at: DateTime<Utc>,
        now: DateTime<Utc>,
        summary: &mut DispatchSummary,
    ) -> Result<(), SchedulerError> {
        let lease = match self.jobs.claim_for_dispatch(job_id).await {
            Ok(lease) => lease,
            Err(SchedulerError::LeaseUnavailable(_)) => {
                warn!("Job busy, dispatch deferred");
                self.requeue(job_id, queued_at);
                summary.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // The job may have been paused, removed or moved while queued
        let job = match self.jobs.find_by_id(job_id).await? {
            Some(job) if job.is_schedulable() => job,
            _ => {
                debug!("Job no longer schedulable, skipped");
                summary.skipped += 1;
                return Ok(());
            }
        };
        let first = match job.next_fire_time {
            Some(first) if first <= now => first,
            Some(later) => {
                self.with_queue(|queue| queue.upsert(job_id, later));
                summary.skipped += 1;
                return Ok(());
            }
            None => {
                summary.skipped += 1;
                return Ok(());
            }
        };

        let plan = plan_fires(
            &job.trigger,
            first,
            now,
            job.misfire_grace_seconds,
            MAX_BACKLOG_FIRES,
        );

        for action in plan.actions(job.coalesce, now, job.misfire_grace_seconds) {
            match action {
                FireAction::Submit(fire_time) => {
                    match self.pool.submit(&job, Dispatch::scheduled(fire_time)).await {
                        Ok(handle) => {
                            summary.submitted += 1;
                            summary.executions.push(handle);
                        }
                        Err(e) => {
                            let label = match e {
                                SubmitError::CapacityExceeded { .. } => "max_instances",
                                SubmitError::PoolSaturated { .. } => "pool_saturated",
                                SubmitError::ShuttingDown => "shutting_down",
                                SubmitError::Database(_) => "database",
                            };
                            self.misfire(job_id, fire_time, now, &e.to_string(), label).await;
                            summary.misfired += 1;
                        }
                    }
                }
                FireAction::Misfire { fire_time, reason } => {
                    self.misfire(job_id, fire_time, now, &reason, "late").await;
                    summary.misfired += 1;
                }
            }
        }

        let (next, status) = match plan.next {
            Ok(Some(next)) => (Some(next), JobStatus::Running),
            Ok(None) => {
                info!("Trigger exhausted, job completed");
                (None, JobStatus::Completed)
            }
            Err(e) => {
                error!(error = %e, "Trigger can no longer be evaluated");
                (None, JobStatus::Error)
            }
        };

        self.write_back(lease, next, status).await;
        Ok(())
    }

    async fn misfire(
        &self,
        job_id: Uuid,
        fire_time: DateTime<Utc>,
        now: DateTime<Utc>,
        reason: &str,
        label: &'static str,
    ) {
        telemetry::record_misfire(label);
        let executions = &self.executions;
        let result = retry_with(&self.backoff, move |_| {
            executions.record_misfire(job_id, fire_time, now, reason)
        })
        .await;
        if let Err(e) = result {
            error!(
                job_id = %job_id,
                scheduled_fire_time = %fire_time,
                error = %e,
                "Failed to record misfire, parked until next wake"
            );
            self.parked_misfires
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(ParkedMisfire {
                    job_id,
                    fire_time,
                    decided_at: now,
                    reason: reason.to_string(),
                });
        }
    }

    /// Retry parked misfire records once each
    async fn flush_parked_misfires(&self) {
        let parked = std::mem::take(&mut *self.parked_misfires.lock().unwrap_or_else(|e| e.into_inner()));
        if parked.is_empty() {
            return;
        }

        let mut still_parked = Vec::new();
        for entry in parked {
            match self
                .executions
                .record_misfire(entry.job_id, entry.fire_time, entry.decided_at, &entry.reason)
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        job_id = %entry.job_id,
                        scheduled_fire_time = %entry.fire_time,
                        error = %e,
                        "Parked misfire record still failing"
                    );
                    still_parked.push(entry);
                }
            }
        }

        self.parked_misfires
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(still_parked);
    }

    /// Persist the new state under the lease, retrying with backoff
    ///
    /// A write-back that keeps failing keeps its lease and is parked until
    /// the next wake; the job stays out of the queue meanwhile.
    async fn write_back(&self, lease: JobLease, next: Option<DateTime<Utc>>, status: JobStatus) {
        let job_id = lease.job_id();
        let mut lease = lease;
        let mut attempt = 0;

        loop {
            match self.jobs.release_after_dispatch(lease, next, status).await {
                Ok(()) => {
                    if let (JobStatus::Running, Some(next)) = (status, next) {
                        self.with_queue(|queue| queue.upsert(job_id, next));
                    }
                    return;
                }
                Err(ReleaseFailure { lease: held, error }) => {
                    lease = held;
                    match self.backoff.next_delay(attempt) {
                        Some(delay) => {
                            warn!(
                                job_id = %job_id,
                                attempt = attempt + 1,
                                error = %error,
                                "Write-back failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            error!(
                                job_id = %job_id,
                                error = %error,
                                "Write-back failed, parked until next wake"
                            );
                            self.stalled
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .push(StalledWriteback {
                                    lease,
                                    next_fire_time: next,
                                    status,
                                });
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Retry parked write-backs once each
    async fn flush_stalled(&self) {
        let parked = std::mem::take(&mut *self.stalled.lock().unwrap_or_else(|e| e.into_inner()));
        if parked.is_empty() {
            return;
        }

        let mut still_stalled = Vec::new();
        for entry in parked {
            let job_id = entry.lease.job_id();
            match self
                .jobs
                .release_after_dispatch(entry.lease, entry.next_fire_time, entry.status)
                .await
            {
                Ok(()) => {
                    info!(job_id = %job_id, "Parked write-back persisted");
                    if let (JobStatus::Running, Some(next)) = (entry.status, entry.next_fire_time) {
                        self.with_queue(|queue| queue.upsert(job_id, next));
                    }
                }
                Err(ReleaseFailure { lease, error }) => {
                    warn!(job_id = %job_id, error = %error, "Parked write-back still failing");
                    still_stalled.push(StalledWriteback {
                        lease,
                        next_fire_time: entry.next_fire_time,
                        status: entry.status,
                    });
                }
            }
        }

        self.stalled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(still_stalled);
    }
}

/// The dispatch loop; the idle wait below is its only suspension point
async fn run_loop(core: Arc<SchedulerCore>, mut shutdown_rx: watch::Receiver<bool>) {
    let slot_freed = core.pool.slot_freed();
    info!("Scheduler loop running");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let wait = core.next_wait();
        core.set_state(LoopState::IdleWaiting);
        debug!(wait_ms = wait.as_millis() as u64, "Scheduler idle");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = core.control.notified() => {
                debug!("Woken by control operation");
            }
            _ = slot_freed.notified() => {
                debug!("Woken by freed worker slot");
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping scheduler loop");
                    break;
                }
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }

        let now = core.clock.now();
        match core.dispatch_due(now).await {
            Ok(_) | Err(SchedulerError::ShuttingDown) => {}
            Err(e) => error!(error = %e, "Error dispatching due jobs"),
        }
    }

    info!("Scheduler loop stopped");
}
