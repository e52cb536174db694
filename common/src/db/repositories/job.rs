// Job repository implementation

use crate::db::DbPool;
use crate::errors::{DatabaseError, SchedulerError};
use crate::lease::{JobLease, LeaseTable};
use crate::models::{Job, JobFilter, JobStatus, Trigger};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

const JOB_COLUMNS: &str = r#"
    id, name, description, payload_ref, trigger_config, args, kwargs,
    max_instances, misfire_grace_seconds, coalesce_missed, status, next_fire_time,
    created_at, updated_at
"#;

/// A write-back that could not be persisted; the lease is handed back
#[derive(Debug)]
pub struct ReleaseFailure {
    pub lease: JobLease,
    pub error: DatabaseError,
}

/// Repository for job-related database operations
#[derive(Clone)]
pub struct JobRepository {
    pool: DbPool,
    leases: Arc<LeaseTable>,
    lease_timeout: Duration,
}

impl JobRepository {
    /// Create a new JobRepository
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            leases: Arc::new(LeaseTable::new()),
            lease_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// Insert a new job
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    pub async fn create(&self, job: &Job) -> Result<(), DatabaseError> {
        let trigger_config = serde_json::to_string(&job.trigger)?;
        let args = serde_json::to_string(&job.args)?;
        let kwargs = serde_json::to_string(&job.kwargs)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, description, payload_ref, trigger_config, args, kwargs,
                max_instances, misfire_grace_seconds, coalesce_missed, status, next_fire_time,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.payload_ref)
        .bind(trigger_config)
        .bind(args)
        .bind(kwargs)
        .bind(job.max_instances as i64)
        .bind(job.misfire_grace_seconds as i64)
        .bind(job.coalesce)
        .bind(job.status.to_string())
        .bind(job.next_fire_time)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.pool.pool())
        .await?;

        tracing::info!(
            job_id = %job.id,
            trigger = job.trigger.kind(),
            next_fire_time = ?job.next_fire_time,
            "Job created"
        );
        Ok(())
    }

    /// Find a job by ID
    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// List jobs; removed jobs only show up when filtered for explicitly
    #[instrument(skip(self))]
    pub async fn find_with_filter(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM jobs WHERE 1 = 1", JOB_COLUMNS));

        match filter.status {
            Some(status) => {
                query.push(" AND status = ").push_bind(status.to_string());
            }
            None => {
                query
                    .push(" AND status != ")
                    .push_bind(JobStatus::Removed.to_string());
            }
        }

        if let Some(name) = &filter.name_contains {
            query.push(" AND instr(name, ").push_bind(name.clone()).push(") > 0");
        }

        query.push(" ORDER BY created_at ASC, id ASC");
        push_pagination(&mut query, filter.limit, filter.offset);

        let rows = query.build().fetch_all(self.pool.pool()).await?;
        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(count = jobs.len(), "Found jobs with filter");
        Ok(jobs)
    }

    /// Jobs the scheduler loop should hold in its queue
    #[instrument(skip(self))]
    pub async fn find_schedulable(&self) -> Result<Vec<Job>, DatabaseError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE status = ? AND next_fire_time IS NOT NULL
            ORDER BY next_fire_time ASC, id ASC
            "#,
            JOB_COLUMNS
        ))
        .bind(JobStatus::Running.to_string())
        .fetch_all(self.pool.pool())
        .await?;

        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(count = jobs.len(), "Found schedulable jobs");
        Ok(jobs)
    }

    /// Overwrite every mutable column of an existing job
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn update_definition(&self, job: &Job) -> Result<(), DatabaseError> {
        let trigger_config = serde_json::to_string(&job.trigger)?;
        let args = serde_json::to_string(&job.args)?;
        let kwargs = serde_json::to_string(&job.kwargs)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET name = ?,
                description = ?,
                payload_ref = ?,
                trigger_config = ?,
                args = ?,
                kwargs = ?,
                max_instances = ?,
                misfire_grace_seconds = ?,
                coalesce_missed = ?,
                status = ?,
                next_fire_time = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.payload_ref)
        .bind(trigger_config)
        .bind(args)
        .bind(kwargs)
        .bind(job.max_instances as i64)
        .bind(job.misfire_grace_seconds as i64)
        .bind(job.coalesce)
        .bind(job.status.to_string())
        .bind(job.next_fire_time)
        .bind(job.updated_at)
        .bind(job.id)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Job not found: {}", job.id)));
        }

        tracing::info!(job_id = %job.id, status = %job.status, "Job updated");
        Ok(())
    }

    /// Persist the scheduling state of a job
    #[instrument(skip(self))]
    pub async fn set_state(
        &self,
        id: Uuid,
        next_fire_time: Option<DateTime<Utc>>,
        status: JobStatus,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE jobs SET next_fire_time = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(next_fire_time)
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Job not found: {}", id)));
        }

        tracing::debug!(job_id = %id, status = %status, next_fire_time = ?next_fire_time, "Job state saved");
        Ok(())
    }

    /// Claim the exclusive lease on a job, waiting up to the lease timeout
    pub async fn claim_for_dispatch(&self, job_id: Uuid) -> Result<JobLease, SchedulerError> {
        self.leases.acquire(job_id, self.lease_timeout).await
    }

    /// Persist the post-decision state and release the lease
    ///
    /// When the write fails the lease comes back with the error so the caller
    /// can retry without letting anyone else in.
    pub async fn release_after_dispatch(
        &self,
        lease: JobLease,
        next_fire_time: Option<DateTime<Utc>>,
        status: JobStatus,
    ) -> Result<(), ReleaseFailure> {
        match self.set_state(lease.job_id(), next_fire_time, status).await {
            Ok(()) => Ok(()),
            Err(error) => Err(ReleaseFailure { lease, error }),
        }
    }
}

pub(crate) fn push_pagination(query: &mut QueryBuilder<'_, Sqlite>, limit: Option<i64>, offset: Option<i64>) {
    match (limit, offset) {
        (Some(limit), offset) => {
            query.push(" LIMIT ").push_bind(limit.max(0));
            if let Some(offset) = offset {
                query.push(" OFFSET ").push_bind(offset.max(0));
            }
        }
        // SQLite only takes OFFSET after a LIMIT; -1 means unbounded
        (None, Some(offset)) => {
            query.push(" LIMIT -1 OFFSET ").push_bind(offset.max(0));
        }
        (None, None) => {}
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, DatabaseError> {
    let trigger_config: String = row.try_get("trigger_config")?;
    let trigger: Trigger = serde_json::from_str(&trigger_config)?;

    let args: String = row.try_get("args")?;
    let kwargs: String = row.try_get("kwargs")?;

    let status: String = row.try_get("status")?;
    let status = status.parse::<JobStatus>().map_err(DatabaseError::Serialization)?;

    let max_instances: i64 = row.try_get("max_instances")?;
    let misfire_grace_seconds: i64 = row.try_get("misfire_grace_seconds")?;

    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        payload_ref: row.try_get("payload_ref")?,
        trigger,
        args: serde_json::from_str(&args)?,
        kwargs: serde_json::from_str(&kwargs)?,
        max_instances: u32::try_from(max_instances)
            .map_err(|e| DatabaseError::Serialization(format!("max_instances: {}", e)))?,
        misfire_grace_seconds: u64::try_from(misfire_grace_seconds)
            .map_err(|e| DatabaseError::Serialization(format!("misfire_grace_seconds: {}", e)))?,
        coalesce: row.try_get("coalesce_missed")?,
        status,
        next_fire_time: row.try_get("next_fire_time")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_job(name: &str) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: Some("nightly report".to_string()),
            payload_ref: "echo".to_string(),
            trigger: Trigger::cron("0 2 * * *").unwrap(),
            args: serde_json::json!([1, "two"]),
            kwargs: serde_json::Map::new(),
            max_instances: 2,
            misfire_grace_seconds: 30,
            coalesce: true,
            status: JobStatus::Running,
            next_fire_time: Some(Utc.with_ymd_and_hms(2030, 1, 1, 2, 0, 0).unwrap()),
            created_at: now,
            updated_at: now,
        }
    }

    async fn repo() -> JobRepository {
        JobRepository::new(DbPool::in_memory().await.unwrap())
            .with_lease_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_create_and_find_round_trips_definition() {
        let repo = repo().await;
        let job = sample_job("report");
        repo.create(&job).await.unwrap();

        let found = repo.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(found.name, job.name);
        assert_eq!(found.trigger, job.trigger);
        assert_eq!(found.args, job.args);
        assert_eq!(found.max_instances, 2);
        assert!(found.coalesce);
        assert_eq!(found.next_fire_time, job.next_fire_time);

        assert!(repo.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filter_hides_removed_jobs() {
        let repo = repo().await;
        let kept = sample_job("kept");
        let mut removed = sample_job("gone");
        removed.status = JobStatus::Removed;
        removed.next_fire_time = None;
        repo.create(&kept).await.unwrap();
        repo.create(&removed).await.unwrap();

        let all = repo.find_with_filter(&JobFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, kept.id);

        let tombstones = repo
            .find_with_filter(&JobFilter {
                status: Some(JobStatus::Removed),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].id, removed.id);
    }

    #[tokio::test]
    async fn test_filter_by_name_and_page() {
        let repo = repo().await;
        for name in ["backup-a", "backup-b", "cleanup"] {
            repo.create(&sample_job(name)).await.unwrap();
        }

        let backups = repo
            .find_with_filter(&JobFilter {
                name_contains: Some("backup".to_string()),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(backups.len(), 2);

        let page = repo
            .find_with_filter(&JobFilter {
                limit: Some(2),
                offset: Some(2),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_schedulable_excludes_paused() {
        let repo = repo().await;
        let running = sample_job("running");
        let mut paused = sample_job("paused");
        paused.status = JobStatus::Paused;
        paused.next_fire_time = None;
        repo.create(&running).await.unwrap();
        repo.create(&paused).await.unwrap();

        let schedulable = repo.find_schedulable().await.unwrap();
        assert_eq!(schedulable.len(), 1);
        assert_eq!(schedulable[0].id, running.id);
    }

    #[tokio::test]
    async fn test_set_state_on_missing_job_is_not_found() {
        let repo = repo().await;
        let result = repo.set_state(Uuid::new_v4(), None, JobStatus::Paused).await;
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_release_after_dispatch_persists_and_frees_lease() {
        let repo = repo().await;
        let job = sample_job("leased");
        repo.create(&job).await.unwrap();

        let lease = repo.claim_for_dispatch(job.id).await.unwrap();
        assert!(matches!(
            repo.claim_for_dispatch(job.id).await,
            Err(SchedulerError::LeaseUnavailable(_))
        ));

        repo.release_after_dispatch(lease, None, JobStatus::Completed)
            .await
            .unwrap();

        let stored = repo.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.next_fire_time, None);
        assert!(repo.claim_for_dispatch(job.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_release_hands_lease_back() {
        let repo = repo().await;
        let missing = Uuid::new_v4();

        let lease = repo.claim_for_dispatch(missing).await.unwrap();
        let failure = repo
            .release_after_dispatch(lease, None, JobStatus::Running)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, DatabaseError::NotFound(_)));
        assert_eq!(failure.lease.job_id(), missing);
        assert!(repo.leases().is_held(missing));
    }
}
