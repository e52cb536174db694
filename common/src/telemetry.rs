// Telemetry module for structured logging, metrics, and tracing

use crate::models::ExecutionOutcome;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "job-scheduler";

/// Initialize structured logging with JSON formatting and trace context
///
/// This function sets up the tracing subscriber with:
/// - JSON formatting for structured logs
/// - Trace context (trace_id, span_id) in all log entries
/// - Log levels from `RUST_LOG` or the configured level
/// - Optional OpenTelemetry export when an endpoint is configured
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Flush remaining spans; call on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter
///
/// Registers:
/// - job_executions_total: executions by final outcome
/// - job_misfires_total: fires that were skipped
/// - job_execution_duration_seconds: histogram of execution durations
/// - job_outcomes_unpersisted_total: outcomes the job store never received
/// - dispatch_queue_size: jobs waiting in the dispatch queue
/// - worker_pool_in_flight: executions currently holding a worker slot
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "job_executions_total",
        "Total number of finished job executions by outcome"
    );
    describe_counter!("job_misfires_total", "Total number of missed fires");
    describe_histogram!(
        "job_execution_duration_seconds",
        "Duration of job executions in seconds"
    );
    describe_counter!(
        "job_outcomes_unpersisted_total",
        "Finished executions whose outcome could not be written to the job store"
    );
    describe_gauge!("dispatch_queue_size", "Jobs waiting in the dispatch queue");
    describe_gauge!(
        "worker_pool_in_flight",
        "Executions currently occupying a worker slot"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Count a finished execution and record how long it took
#[inline]
pub fn record_execution(outcome: ExecutionOutcome, duration_seconds: f64) {
    counter!("job_executions_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("job_execution_duration_seconds", "outcome" => outcome.to_string())
        .record(duration_seconds);
}

#[inline]
pub fn record_misfire(reason: &'static str) {
    counter!("job_misfires_total", "reason" => reason).increment(1);
}

#[inline]
pub fn record_unpersisted_outcome() {
    counter!("job_outcomes_unpersisted_total").increment(1);
}

#[inline]
pub fn update_queue_size(size: usize) {
    gauge!("dispatch_queue_size").set(size as f64);
}

#[inline]
pub fn update_in_flight(in_flight: usize) {
    gauge!("worker_pool_in_flight").set(in_flight as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_reach_the_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_execution(ExecutionOutcome::Success, 1.5);
            record_execution(ExecutionOutcome::Failure, 0.2);
            record_misfire("late");
            record_misfire("late");
            record_unpersisted_outcome();
            update_queue_size(10);
            update_in_flight(3);
        });

        let rendered = handle.render();
        assert!(rendered.contains("job_executions_total{outcome=\"success\"} 1"));
        assert!(rendered.contains("job_executions_total{outcome=\"failure\"} 1"));
        assert!(rendered.contains("job_misfires_total{reason=\"late\"} 2"));
        assert!(rendered.contains("job_outcomes_unpersisted_total 1"));
        assert!(rendered.contains("dispatch_queue_size 10"));
        assert!(rendered.contains("worker_pool_in_flight 3"));
    }
}
