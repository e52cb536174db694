// Error handling framework

use thiserror::Error;
use uuid::Uuid;

/// Trigger configuration and evaluation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No fire time for '{expression}' within {lookahead_years} years")]
    NoFutureMatch {
        expression: String,
        lookahead_years: i32,
    },

    #[error("Trigger has no future fire time")]
    Exhausted,
}

/// Failure of the invoked work itself
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("unresolvable payload: {0}")]
    Unresolvable(String),

    #[error("payload panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionError::Failed(message.into())
    }
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Column could not be decoded: {0}")]
    Serialization(String),
}

/// Worker pool submission errors
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Job {job_id} already has {max_instances} running instance(s)")]
    CapacityExceeded { job_id: Uuid, max_instances: u32 },

    #[error("Worker pool saturated ({capacity} slots busy)")]
    PoolSaturated { capacity: usize },

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors surfaced by the scheduler's control operations
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// No job, or no execution record, with this id
    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("Execution {0} is still running")]
    ExecutionRunning(Uuid),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job {job_id} already has {max_instances} running instance(s)")]
    CapacityExceeded { job_id: Uuid, max_instances: u32 },

    #[error("Worker pool saturated ({capacity} slots busy)")]
    PoolSaturated { capacity: usize },

    #[error("Lease on job {0} could not be claimed in time")]
    LeaseUnavailable(Uuid),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<ScheduleError> for SchedulerError {
    fn from(err: ScheduleError) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

impl From<SubmitError> for SchedulerError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::CapacityExceeded {
                job_id,
                max_instances,
            } => SchedulerError::CapacityExceeded {
                job_id,
                max_instances,
            },
            SubmitError::PoolSaturated { capacity } => SchedulerError::PoolSaturated { capacity },
            SubmitError::ShuttingDown => SchedulerError::ShuttingDown,
            SubmitError::Database(e) => SchedulerError::Database(e),
        }
    }
}

// Implement From for common external errors
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    DatabaseError::DuplicateKey(db_err.message().to_string())
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DatabaseError::Serialization(format!("{}: {}", index, source))
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_becomes_configuration_error() {
        let err: SchedulerError = ScheduleError::InvalidInterval("zero".to_string()).into();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert!(err.to_string().contains("zero"));
    }

    #[test]
    fn test_submit_errors_map_onto_control_errors() {
        let job_id = Uuid::new_v4();
        let err: SchedulerError = SubmitError::CapacityExceeded {
            job_id,
            max_instances: 2,
        }
        .into();
        assert!(matches!(
            err,
            SchedulerError::CapacityExceeded { max_instances: 2, .. }
        ));

        let err: SchedulerError = SubmitError::PoolSaturated { capacity: 4 }.into();
        assert!(matches!(err, SchedulerError::PoolSaturated { capacity: 4 }));

        let err: SchedulerError = SubmitError::ShuttingDown.into();
        assert!(matches!(err, SchedulerError::ShuttingDown));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: DatabaseError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }
}
