// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub job_defaults: JobDefaults,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps without a due job
    pub max_idle_wait_seconds: u64,
    /// How long control operations and dispatch wait for a job lease
    pub lease_timeout_ms: u64,
    /// How long shutdown waits for in-flight executions
    pub shutdown_timeout_seconds: u64,
    pub writeback_attempts: u32,
    pub writeback_base_delay_ms: u64,
}

impl SchedulerConfig {
    pub fn max_idle_wait(&self) -> Duration {
        Duration::from_secs(self.max_idle_wait_seconds)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Total concurrent execution slots
    pub concurrency: u32,
    /// Payload output longer than this is truncated before it is recorded
    pub output_max_chars: usize,
}

/// Values applied when a job spec leaves them out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    pub max_instances: u32,
    pub misfire_grace_seconds: u64,
    pub coalesce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            // Built-in defaults so partial files still deserialize
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        // Validate database config
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }
        if self.database.min_connections > self.database.max_connections {
            return Err("Database min_connections cannot exceed max_connections".to_string());
        }

        // Validate scheduler config
        if self.scheduler.max_idle_wait_seconds == 0 {
            return Err("Scheduler max_idle_wait_seconds must be greater than 0".to_string());
        }
        if self.scheduler.lease_timeout_ms == 0 {
            return Err("Scheduler lease_timeout_ms must be greater than 0".to_string());
        }
        if self.scheduler.writeback_attempts == 0 {
            return Err("Scheduler writeback_attempts must be greater than 0".to_string());
        }

        // Validate worker config
        if self.worker.concurrency == 0 {
            return Err("Worker concurrency must be greater than 0".to_string());
        }
        if self.worker.output_max_chars == 0 {
            return Err("Worker output_max_chars must be greater than 0".to_string());
        }

        // Validate job defaults
        if self.job_defaults.max_instances == 0 {
            return Err("Job default max_instances must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://data/scheduler.db".to_string(),
                max_connections: 5,
                min_connections: 1,
                connect_timeout_seconds: 30,
            },
            scheduler: SchedulerConfig {
                max_idle_wait_seconds: 60,
                lease_timeout_ms: 5_000,
                shutdown_timeout_seconds: 30,
                writeback_attempts: 5,
                writeback_base_delay_ms: 50,
            },
            worker: WorkerConfig {
                concurrency: 20,
                output_max_chars: 10_000,
            },
            job_defaults: JobDefaults {
                max_instances: 1,
                misfire_grace_seconds: 60,
                coalesce: false,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}
