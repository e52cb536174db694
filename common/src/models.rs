use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use uuid::Uuid;

// Helper functions for Tz serialization
fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&tz.to_string())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

fn default_tz() -> Tz {
    chrono_tz::UTC
}

fn any_field() -> String {
    "*".to_string()
}

// ============================================================================
// Job Models
// ============================================================================

/// Job is a persisted, scheduled unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Key resolved through the payload registry at dispatch time
    pub payload_ref: String,
    pub trigger: Trigger,
    /// Positional arguments, always a JSON array
    pub args: serde_json::Value,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub max_instances: u32,
    pub misfire_grace_seconds: u64,
    pub coalesce: bool,
    pub status: JobStatus,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the scheduler loop may consider this job for dispatch
    pub fn is_schedulable(&self) -> bool {
        self.status == JobStatus::Running && self.next_fire_time.is_some()
    }
}

/// Trigger decides when a job fires next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Cron {
        #[serde(flatten)]
        fields: CronFields,
        #[serde(
            default = "default_tz",
            serialize_with = "serialize_tz",
            deserialize_with = "deserialize_tz"
        )]
        timezone: Tz,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_date: Option<DateTime<Utc>>,
    },
    Interval {
        every_seconds: u64,
        /// Anchor of the firing grid; filled in at job creation when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_date: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_date: Option<DateTime<Utc>>,
    },
    Date {
        run_at: DateTime<Utc>,
    },
}

impl Trigger {
    /// Cron trigger in UTC from a five-field crontab expression
    pub fn cron(expression: &str) -> Result<Self, crate::errors::ScheduleError> {
        Ok(Trigger::Cron {
            fields: CronFields::from_expression(expression)?,
            timezone: default_tz(),
            end_date: None,
        })
    }

    /// Interval trigger whose first fire is decided at job creation
    pub fn interval(every_seconds: u64) -> Self {
        Trigger::Interval {
            every_seconds,
            start_date: None,
            end_date: None,
        }
    }

    pub fn date(run_at: DateTime<Utc>) -> Self {
        Trigger::Date { run_at }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Cron { .. } => "cron",
            Trigger::Interval { .. } => "interval",
            Trigger::Date { .. } => "date",
        }
    }
}

/// Crontab fields; each accepts the usual `*`, lists, ranges and steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronFields {
    #[serde(default = "any_field")]
    pub minute: String,
    #[serde(default = "any_field")]
    pub hour: String,
    #[serde(default = "any_field")]
    pub day: String,
    #[serde(default = "any_field")]
    pub month: String,
    #[serde(default = "any_field")]
    pub day_of_week: String,
}

impl Default for CronFields {
    fn default() -> Self {
        Self {
            minute: any_field(),
            hour: any_field(),
            day: any_field(),
            month: any_field(),
            day_of_week: any_field(),
        }
    }
}

impl CronFields {
    /// Split `"*/5 9-17 * * mon-fri"` into its five fields
    pub fn from_expression(expression: &str) -> Result<Self, crate::errors::ScheduleError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(crate::errors::ScheduleError::InvalidCronExpression {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, found {}", parts.len()),
            });
        }
        Ok(Self {
            minute: parts[0].to_string(),
            hour: parts[1].to_string(),
            day: parts[2].to_string(),
            month: parts[3].to_string(),
            day_of_week: parts[4].to_string(),
        })
    }
}

impl std::fmt::Display for CronFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day, self.month, self.day_of_week
        )
    }
}

/// JobStatus governs whether a job is eligible for dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Paused,
    Error,
    Removed,
    /// Trigger exhausted; terminal and distinct from `Paused`
    Completed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Removed => write!(f, "removed"),
            JobStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "error" => Ok(JobStatus::Error),
            "removed" => Ok(JobStatus::Removed),
            "completed" => Ok(JobStatus::Completed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// JobSpec is what the registrar submits to create a job
///
/// Omitted concurrency and misfire settings fall back to the configured
/// job defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub payload_ref: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub misfire_grace_seconds: Option<u64>,
    #[serde(default)]
    pub coalesce: Option<bool>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, payload_ref: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            description: None,
            payload_ref: payload_ref.into(),
            trigger,
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            max_instances: None,
            misfire_grace_seconds: None,
            coalesce: None,
        }
    }

    pub fn with_max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = Some(max_instances);
        self
    }

    pub fn with_misfire_grace(mut self, seconds: u64) -> Self {
        self.misfire_grace_seconds = Some(seconds);
        self
    }

    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: serde_json::Map<String, serde_json::Value>) -> Self {
        self.kwargs = kwargs;
        self
    }
}

/// Partial update; `None` leaves the field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub payload_ref: Option<String>,
    pub trigger: Option<Trigger>,
    pub args: Option<Vec<serde_json::Value>>,
    pub kwargs: Option<serde_json::Map<String, serde_json::Value>>,
    pub max_instances: Option<u32>,
    pub misfire_grace_seconds: Option<u64>,
    pub coalesce: Option<bool>,
}

/// Filter for listing jobs. Removed jobs are hidden unless asked for by status.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub name_contains: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ============================================================================
// Execution Models
// ============================================================================

/// ExecutionRecord is one attempt (or one missed fire) of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub trigger_source: TriggerSource,
    /// The fire being served; `None` for manual runs
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub status: ExecutionOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl ExecutionRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// ExecutionOutcome is the status of an execution record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Running,
    Success,
    Failure,
    Misfired,
}

impl ExecutionOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionOutcome::Running)
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::Running => write!(f, "running"),
            ExecutionOutcome::Success => write!(f, "success"),
            ExecutionOutcome::Failure => write!(f, "failure"),
            ExecutionOutcome::Misfired => write!(f, "misfired"),
        }
    }
}

impl FromStr for ExecutionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionOutcome::Running),
            "success" => Ok(ExecutionOutcome::Success),
            "failure" => Ok(ExecutionOutcome::Failure),
            "misfired" => Ok(ExecutionOutcome::Misfired),
            _ => Err(format!("Invalid execution outcome: {}", s)),
        }
    }
}

/// TriggerSource records how an execution was started
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduled,
    Manual,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Scheduled => write!(f, "scheduled"),
            TriggerSource::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerSource::Scheduled),
            "manual" => Ok(TriggerSource::Manual),
            _ => Err(format!("Invalid trigger source: {}", s)),
        }
    }
}

/// Filter for querying the execution log
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub job_id: Option<Uuid>,
    pub outcome: Option<ExecutionOutcome>,
    /// Inclusive lower bound on `started_at`
    pub started_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ExecutionFilter {
    pub fn for_job(job_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    pub fn with_outcome(mut self, outcome: ExecutionOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}
