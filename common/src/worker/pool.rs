// Worker pool: bounded execution slots with per-job instance caps

use crate::db::repositories::execution::{seconds_between, ExecutionRepository};
use crate::errors::{ExecutionError, SubmitError};
use crate::models::{ExecutionOutcome, ExecutionRecord, Job, TriggerSource};
use crate::retry::{retry_with, ExponentialBackoff};
use crate::scheduler::clock::Clock;
use crate::telemetry;
use crate::worker::registry::{PayloadContext, PayloadRegistry, PayloadResult};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// How an execution came to be and which fire it serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub source: TriggerSource,
    pub fire_time: Option<DateTime<Utc>>,
}

impl Dispatch {
    pub fn scheduled(fire_time: DateTime<Utc>) -> Self {
        Self {
            source: TriggerSource::Scheduled,
            fire_time: Some(fire_time),
        }
    }

    pub fn manual() -> Self {
        Self {
            source: TriggerSource::Manual,
            fire_time: None,
        }
    }
}

/// Handle to a submitted execution
#[derive(Debug)]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    pub job_id: Uuid,
    join: JoinHandle<ExecutionRecord>,
}

impl ExecutionHandle {
    /// Wait for the execution to finish and return its final record
    pub async fn wait(self) -> Option<ExecutionRecord> {
        self.join.await.ok()
    }
}

struct PoolInner {
    capacity: usize,
    slots: Arc<Semaphore>,
    instances: Mutex<HashMap<Uuid, u32>>,
    registry: Arc<PayloadRegistry>,
    executions: ExecutionRepository,
    clock: Arc<dyn Clock>,
    output_max_chars: usize,
    closed: AtomicBool,
    slot_freed: Arc<Notify>,
    /// Outcomes whose record stayed `running` in the store
    unpersisted: AtomicU64,
}

impl PoolInner {
    fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }
}

/// Reservation of one worker slot and one instance of a job
///
/// Dropping it gives both back and wakes the scheduler loop.
struct InstanceSlot {
    job_id: Uuid,
    inner: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for InstanceSlot {
    fn drop(&mut self) {
        {
            let mut instances = self.inner.instances.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(count) = instances.get_mut(&self.job_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    instances.remove(&self.job_id);
                }
            }
        }
        self.permit.take();
        telemetry::update_in_flight(self.inner.in_flight());
        self.inner.slot_freed.notify_one();
    }
}

/// Bounded pool executing job payloads on tokio tasks
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        capacity: usize,
        output_max_chars: usize,
        registry: Arc<PayloadRegistry>,
        executions: ExecutionRepository,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                slots: Arc::new(Semaphore::new(capacity)),
                instances: Mutex::new(HashMap::new()),
                registry,
                executions,
                clock,
                output_max_chars,
                closed: AtomicBool::new(false),
                slot_freed: Arc::new(Notify::new()),
                unpersisted: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Executions currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    /// Running instances of one job
    pub fn running_for(&self, job_id: Uuid) -> u32 {
        self.inner
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn registry(&self) -> &Arc<PayloadRegistry> {
        &self.inner.registry
    }

    /// Notified each time an execution gives its slot back
    pub fn slot_freed(&self) -> Arc<Notify> {
        self.inner.slot_freed.clone()
    }

    /// Finished executions whose outcome could not be written to the store
    ///
    /// Their records read `running` until the next restore reconciles them.
    pub fn unpersisted_outcomes(&self) -> u64 {
        self.inner.unpersisted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn reserve(&self, job: &Job) -> Result<InstanceSlot, SubmitError> {
        if self.is_closed() {
            return Err(SubmitError::ShuttingDown);
        }

        let mut instances = self.inner.instances.lock().unwrap_or_else(|e| e.into_inner());
        let running = instances.get(&job.id).copied().unwrap_or(0);
        if running >= job.max_instances {
            return Err(SubmitError::CapacityExceeded {
                job_id: job.id,
                max_instances: job.max_instances,
            });
        }

        let permit = self
            .inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| SubmitError::PoolSaturated {
                capacity: self.inner.capacity,
            })?;

        *instances.entry(job.id).or_insert(0) += 1;

        Ok(InstanceSlot {
            job_id: job.id,
            inner: self.inner.clone(),
            permit: Some(permit),
        })
    }

    /// Start one execution of `job`
    ///
    /// Opens the `running` record before the payload is spawned. Capacity
    /// errors are returned to the caller and never retried here.
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name, source = %dispatch.source))]
    pub async fn submit(&self, job: &Job, dispatch: Dispatch) -> Result<ExecutionHandle, SubmitError> {
        let slot = self.reserve(job)?;
        telemetry::update_in_flight(self.in_flight());

        let started_at = self.inner.clock.now();
        // A failed insert drops the slot, which releases the reservation
        let record = self
            .inner
            .executions
            .start(job.id, dispatch.source, dispatch.fire_time, started_at)
            .await?;

        let ctx = PayloadContext {
            job_id: job.id,
            job_name: job.name.clone(),
            execution_id: record.id,
            trigger_source: dispatch.source,
            scheduled_fire_time: dispatch.fire_time,
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
        };

        let execution_id = record.id;
        let inner = self.inner.clone();
        let payload_ref = job.payload_ref.clone();
        let span = tracing::info_span!("execution", execution_id = %execution_id, job_id = %job.id);

        let join = tokio::spawn(
            async move {
                let started = Instant::now();
                let result = run_payload(&inner.registry, &payload_ref, ctx).await;
                let record = finalize(&inner, record, result, started.elapsed()).await;
                drop(slot);
                record
            }
            .instrument(span),
        );

        info!(execution_id = %execution_id, "Execution submitted");
        Ok(ExecutionHandle {
            execution_id,
            job_id: job.id,
            join,
        })
    }

    /// Refuse further submissions
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!(in_flight = self.in_flight(), "Worker pool closed");
        }
    }

    /// Wait until every in-flight execution has finished
    ///
    /// Returns `false` when `timeout` elapsed first.
    #[instrument(skip(self))]
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = self.inner.capacity as u32;
        match tokio::time::timeout(timeout, self.inner.slots.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                drop(permits);
                info!("Worker pool drained");
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                warn!(in_flight = self.in_flight(), "Worker pool drain timed out");
                false
            }
        }
    }
}

async fn run_payload(registry: &PayloadRegistry, payload_ref: &str, ctx: PayloadContext) -> PayloadResult {
    let payload = registry
        .resolve(payload_ref)
        .ok_or_else(|| ExecutionError::Unresolvable(payload_ref.to_string()))?;

    // Nested task so a panicking payload cannot take the bookkeeping with it
    match tokio::spawn(async move { payload.invoke(ctx).await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ExecutionError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(ExecutionError::Failed(format!("execution cancelled: {}", e))),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Cut `output` down to at most `max_chars` characters
pub fn truncate_output(output: String, max_chars: usize) -> String {
    match output.char_indices().nth(max_chars) {
        Some((byte_index, _)) => output[..byte_index].to_string(),
        None => output,
    }
}

async fn finalize(
    inner: &PoolInner,
    mut record: ExecutionRecord,
    result: PayloadResult,
    elapsed: Duration,
) -> ExecutionRecord {
    let ended_at = inner.clock.now().max(record.started_at);
    record.ended_at = Some(ended_at);
    record.duration_seconds = Some(elapsed.as_secs_f64().max(seconds_between(record.started_at, ended_at)));

    match result {
        Ok(output) => {
            record.status = ExecutionOutcome::Success;
            record.output = output.map(|o| truncate_output(o, inner.output_max_chars));
        }
        Err(e) => {
            record.status = ExecutionOutcome::Failure;
            record.error = Some(truncate_output(e.to_string(), inner.output_max_chars));
        }
    }

    let strategy = ExponentialBackoff::default();
    let executions = &inner.executions;
    let finished = &record;
    match retry_with(&strategy, move |_| executions.finish(finished)).await {
        Ok(_) => {}
        Err(e) => {
            inner.unpersisted.fetch_add(1, Ordering::SeqCst);
            telemetry::record_unpersisted_outcome();
            error!(
                execution_id = %record.id,
                error = %e,
                "Failed to persist execution outcome"
            );
        }
    }

    telemetry::record_execution(record.status, record.duration_seconds.unwrap_or(0.0));
    match record.status {
        ExecutionOutcome::Success => info!(
            duration_seconds = record.duration_seconds,
            "Execution succeeded"
        ),
        _ => warn!(
            duration_seconds = record.duration_seconds,
            error = record.error.as_deref(),
            "Execution failed"
        ),
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbPool;
    use crate::models::{JobStatus, Trigger};
    use crate::scheduler::clock::SystemClock;
    use tokio::sync::oneshot;

    fn job(payload_ref: &str, max_instances: u32) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            name: "pool-test".to_string(),
            description: None,
            payload_ref: payload_ref.to_string(),
            trigger: Trigger::interval(60),
            args: serde_json::json!([]),
            kwargs: serde_json::Map::new(),
            max_instances,
            misfire_grace_seconds: 60,
            coalesce: false,
            status: JobStatus::Running,
            next_fire_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn pool(capacity: usize, registry: PayloadRegistry) -> (WorkerPool, ExecutionRepository) {
        let executions = ExecutionRepository::new(DbPool::in_memory().await.unwrap());
        let pool = WorkerPool::new(
            capacity,
            16,
            Arc::new(registry),
            executions.clone(),
            Arc::new(SystemClock),
        );
        (pool, executions)
    }

    /// Registry with a `gate` payload that blocks until the test releases it
    fn gated_registry() -> (PayloadRegistry, Arc<Mutex<Vec<oneshot::Sender<()>>>>) {
        let gates: Arc<Mutex<Vec<oneshot::Sender<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let registry = PayloadRegistry::with_builtins();
        let senders = gates.clone();
        registry.register_fn("gate", move |_| {
            let (tx, rx) = oneshot::channel();
            senders.lock().unwrap().push(tx);
            async move {
                let _ = rx.await;
                Ok(None)
            }
        });
        (registry, gates)
    }

    #[tokio::test]
    async fn test_success_is_recorded() {
        let (pool, executions) = pool(2, PayloadRegistry::with_builtins()).await;
        let job = job("echo", 1);

        let handle = pool.submit(&job, Dispatch::manual()).await.unwrap();
        let record = handle.wait().await.unwrap();

        assert_eq!(record.status, ExecutionOutcome::Success);
        assert_eq!(record.trigger_source, TriggerSource::Manual);
        let stored = executions.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionOutcome::Success);
        // output truncated to 16 chars
        assert_eq!(stored.output.as_deref().map(|o| o.chars().count()), Some(16));
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.running_for(job.id), 0);
    }

    #[tokio::test]
    async fn test_failure_and_panic_are_captured() {
        let registry = PayloadRegistry::with_builtins();
        registry.register_fn("boom", |_| async move {
            if true {
                panic!("payload exploded");
            }
            Ok(None)
        });
        let (pool, _) = pool(2, registry).await;

        let failed = pool
            .submit(&job("fail", 1), Dispatch::manual())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(failed.status, ExecutionOutcome::Failure);
        assert_eq!(failed.error.as_deref(), Some("job failed"));

        let panicked = pool
            .submit(&job("boom", 1), Dispatch::manual())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(panicked.status, ExecutionOutcome::Failure);
        assert!(panicked.error.unwrap().contains("payload exploded"));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_payload_is_a_failure_record() {
        let (pool, _) = pool(1, PayloadRegistry::new()).await;
        let record = pool
            .submit(&job("missing", 1), Dispatch::manual())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionOutcome::Failure);
        assert!(record.error.unwrap().starts_with("unresolvable payload"));
    }

    #[tokio::test]
    async fn test_max_instances_is_enforced() {
        let (registry, gates) = gated_registry();
        let (pool, _) = pool(4, registry).await;
        let job = job("gate", 1);

        let first = pool.submit(&job, Dispatch::manual()).await.unwrap();
        let second = pool.submit(&job, Dispatch::manual()).await;
        assert!(matches!(
            second,
            Err(SubmitError::CapacityExceeded { max_instances: 1, .. })
        ));
        assert_eq!(pool.running_for(job.id), 1);

        for gate in gates.lock().unwrap().drain(..) {
            let _ = gate.send(());
        }
        first.wait().await.unwrap();
        assert!(pool.submit(&job, Dispatch::manual()).await.is_ok());
    }

    #[tokio::test]
    async fn test_pool_saturation() {
        let (registry, gates) = gated_registry();
        let (pool, _) = pool(1, registry).await;

        let _running = pool.submit(&job("gate", 1), Dispatch::manual()).await.unwrap();
        let other = pool.submit(&job("gate", 1), Dispatch::manual()).await;
        assert!(matches!(other, Err(SubmitError::PoolSaturated { capacity: 1 })));

        for gate in gates.lock().unwrap().drain(..) {
            let _ = gate.send(());
        }
    }

    #[tokio::test]
    async fn test_close_and_drain() {
        let (registry, gates) = gated_registry();
        let (pool, _) = pool(2, registry).await;
        let handle = pool.submit(&job("gate", 1), Dispatch::manual()).await.unwrap();

        pool.close();
        assert!(matches!(
            pool.submit(&job("echo", 1), Dispatch::manual()).await,
            Err(SubmitError::ShuttingDown)
        ));
        assert!(!pool.drain(Duration::from_millis(20)).await);

        for gate in gates.lock().unwrap().drain(..) {
            let _ = gate.send(());
        }
        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(handle.wait().await.unwrap().status, ExecutionOutcome::Success);
    }

    #[tokio::test]
    async fn test_unwritable_outcome_is_counted() {
        let db = DbPool::in_memory().await.unwrap();
        let executions = ExecutionRepository::new(db.clone());
        let pool = WorkerPool::new(
            1,
            64,
            Arc::new(PayloadRegistry::with_builtins()),
            executions.clone(),
            Arc::new(SystemClock),
        );
        sqlx::query(
            "CREATE TRIGGER outcomes_offline BEFORE UPDATE ON job_executions \
             BEGIN SELECT RAISE(ABORT, 'store offline'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let record = pool
            .submit(&job("echo", 1), Dispatch::manual())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionOutcome::Success);
        assert_eq!(pool.unpersisted_outcomes(), 1);
        assert_eq!(pool.in_flight(), 0);
        let stored = executions.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionOutcome::Running);
    }

    #[test]
    fn test_truncate_output_respects_char_boundaries() {
        assert_eq!(truncate_output("héllo".to_string(), 2), "hé");
        assert_eq!(truncate_output("short".to_string(), 10), "short");
    }
}
