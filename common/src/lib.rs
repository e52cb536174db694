// Job scheduling core: triggers, job store, dispatch loop and worker pool

pub mod config;
pub mod db;
pub mod errors;
pub mod lease;
pub mod models;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;
pub mod worker;
