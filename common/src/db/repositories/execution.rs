// Execution repository implementation: the durable execution log

use super::job::push_pagination;
use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{ExecutionFilter, ExecutionOutcome, ExecutionRecord, TriggerSource};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::instrument;
use uuid::Uuid;

const EXECUTION_COLUMNS: &str = r#"
    id, job_id, trigger_source, scheduled_fire_time, status,
    started_at, ended_at, duration_seconds, error, output
"#;

/// Error recorded on executions that were running when the process died
pub const INTERRUPTED: &str = "interrupted";

/// Repository for job execution-related database operations
#[derive(Clone)]
pub struct ExecutionRepository {
    pool: DbPool,
}

impl ExecutionRepository {
    /// Create a new ExecutionRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO job_executions (
                id, job_id, trigger_source, scheduled_fire_time, status,
                started_at, ended_at, duration_seconds, error, output
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(record.job_id)
        .bind(record.trigger_source.to_string())
        .bind(record.scheduled_fire_time)
        .bind(record.status.to_string())
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.duration_seconds)
        .bind(&record.error)
        .bind(&record.output)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Open a `running` record for an execution that is about to start
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        job_id: Uuid,
        trigger_source: TriggerSource,
        scheduled_fire_time: Option<DateTime<Utc>>,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, DatabaseError> {
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            job_id,
            trigger_source,
            scheduled_fire_time,
            status: ExecutionOutcome::Running,
            started_at,
            ended_at: None,
            duration_seconds: None,
            error: None,
            output: None,
        };
        self.insert(&record).await?;

        tracing::info!(
            execution_id = %record.id,
            job_id = %job_id,
            trigger_source = %trigger_source,
            "Execution started"
        );
        Ok(record)
    }

    /// Write the terminal outcome of a running record
    ///
    /// Returns `false` when the record was already final (or is gone); a
    /// finalized record is never overwritten.
    #[instrument(skip(self, record), fields(execution_id = %record.id, outcome = %record.status))]
    pub async fn finish(&self, record: &ExecutionRecord) -> Result<bool, DatabaseError> {
        if !record.status.is_terminal() {
            return Err(DatabaseError::QueryFailed(format!(
                "Execution {} cannot be finished as {}",
                record.id, record.status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = ?, ended_at = ?, duration_seconds = ?, error = ?, output = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(record.status.to_string())
        .bind(record.ended_at)
        .bind(record.duration_seconds)
        .bind(&record.error)
        .bind(&record.output)
        .bind(record.id)
        .bind(ExecutionOutcome::Running.to_string())
        .execute(self.pool.pool())
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            tracing::info!(
                job_id = %record.job_id,
                duration_seconds = record.duration_seconds,
                "Execution finished"
            );
        } else {
            tracing::warn!("Execution already final, outcome not recorded");
        }
        Ok(updated)
    }

    /// Append a final `misfired` record for a fire that will not run
    #[instrument(skip(self))]
    pub async fn record_misfire(
        &self,
        job_id: Uuid,
        scheduled_fire_time: DateTime<Utc>,
        decided_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<ExecutionRecord, DatabaseError> {
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            job_id,
            trigger_source: TriggerSource::Scheduled,
            scheduled_fire_time: Some(scheduled_fire_time),
            status: ExecutionOutcome::Misfired,
            started_at: decided_at,
            ended_at: Some(decided_at),
            duration_seconds: Some(0.0),
            error: Some(reason.to_string()),
            output: None,
        };
        self.insert(&record).await?;

        tracing::warn!(
            execution_id = %record.id,
            job_id = %job_id,
            scheduled_fire_time = %scheduled_fire_time,
            reason = reason,
            "Fire missed"
        );
        Ok(record)
    }

    /// Mark every record still `running` as an interrupted failure
    ///
    /// Only valid before any execution of this process has started.
    #[instrument(skip(self))]
    pub async fn reconcile_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let orphans = self
            .find_with_filter(&ExecutionFilter::default().with_outcome(ExecutionOutcome::Running))
            .await?;

        let mut reconciled = Vec::with_capacity(orphans.len());
        for mut record in orphans {
            let ended_at = now.max(record.started_at);
            record.status = ExecutionOutcome::Failure;
            record.ended_at = Some(ended_at);
            record.duration_seconds = Some(seconds_between(record.started_at, ended_at));
            record.error = Some(INTERRUPTED.to_string());

            if self.finish(&record).await? {
                tracing::warn!(
                    execution_id = %record.id,
                    job_id = %record.job_id,
                    "Orphaned execution marked as interrupted"
                );
                reconciled.push(record);
            }
        }

        tracing::info!(count = reconciled.len(), "Execution log reconciled");
        Ok(reconciled)
    }

    /// Find an execution by ID
    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM job_executions WHERE id = ?",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    /// Query the log, oldest first
    #[instrument(skip(self))]
    pub async fn find_with_filter(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM job_executions WHERE 1 = 1",
            EXECUTION_COLUMNS
        ));

        if let Some(job_id) = filter.job_id {
            query.push(" AND job_id = ").push_bind(job_id);
        }
        if let Some(outcome) = filter.outcome {
            query.push(" AND status = ").push_bind(outcome.to_string());
        }
        if let Some(after) = filter.started_after {
            query.push(" AND started_at >= ").push_bind(after);
        }
        if let Some(before) = filter.started_before {
            query.push(" AND started_at < ").push_bind(before);
        }

        query.push(" ORDER BY started_at ASC, id ASC");
        push_pagination(&mut query, filter.limit, filter.offset);

        let rows = query.build().fetch_all(self.pool.pool()).await?;
        let executions = rows
            .iter()
            .map(row_to_execution)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(count = executions.len(), "Found executions with filter");
        Ok(executions)
    }

    /// Delete one finished record; a running record is left alone
    ///
    /// Returns whether a row was deleted.
    #[instrument(skip(self))]
    pub async fn delete_by_id(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM job_executions WHERE id = ? AND status != ?")
            .bind(id)
            .bind(ExecutionOutcome::Running.to_string())
            .execute(self.pool.pool())
            .await?;

        let deleted = result.rows_affected() > 0;
        tracing::info!(execution_id = %id, deleted = deleted, "Deleted execution");
        Ok(deleted)
    }

    /// Delete the finished records of one job; running ones are left alone
    #[instrument(skip(self))]
    pub async fn delete_for_job(&self, job_id: Uuid) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM job_executions WHERE job_id = ? AND status != ?")
            .bind(job_id)
            .bind(ExecutionOutcome::Running.to_string())
            .execute(self.pool.pool())
            .await?;

        let deleted = result.rows_affected();
        tracing::info!(job_id = %job_id, deleted_count = deleted, "Deleted job executions");
        Ok(deleted)
    }

    /// Delete finished records that started before `cutoff`
    #[instrument(skip(self))]
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM job_executions WHERE started_at < ? AND status != ?")
            .bind(cutoff)
            .bind(ExecutionOutcome::Running.to_string())
            .execute(self.pool.pool())
            .await?;

        let deleted = result.rows_affected();
        tracing::info!(deleted_count = deleted, "Purged old executions");
        Ok(deleted)
    }
}

/// Fractional seconds from `start` to `end`, never negative
pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let elapsed = end - start;
    let micros = elapsed.num_microseconds().unwrap_or(i64::MAX);
    (micros.max(0) as f64) / 1_000_000.0
}

fn row_to_execution(row: &SqliteRow) -> Result<ExecutionRecord, DatabaseError> {
    let trigger_source: String = row.try_get("trigger_source")?;
    let status: String = row.try_get("status")?;

    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        trigger_source: trigger_source
            .parse::<TriggerSource>()
            .map_err(DatabaseError::Serialization)?,
        scheduled_fire_time: row.try_get("scheduled_fire_time")?,
        status: status
            .parse::<ExecutionOutcome>()
            .map_err(DatabaseError::Serialization)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        error: row.try_get("error")?,
        output: row.try_get("output")?,
    })
}
