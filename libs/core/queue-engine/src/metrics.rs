//! Prometheus-compatible metrics for the engine.
//!
//! ## Exported series
//!
//! - `jobs_enqueued_total{class}` - jobs accepted by the queue
//! - `jobs_completed_total{class}` - terminal successes
//! - `jobs_failed_total{class, error_type}` - failed attempts by category
//! - `job_processing_duration_ms{class, success}` - handler latency
//! - `queue_depth{class, state}` - per-state depth gauges
//! - `queue_error_rate_percent` - trailing-window error rate
//! - `active_workers{class}` - occupied worker slots
//! - `dlq_current_count` - jobs currently in terminal `failed`
//! - `stalled_jobs_total` - stalled-job detections
//! - `polling_removed_total{reason}` - jobs removed by the polling loop

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const JOBS_ENQUEUED: &str = "jobs_enqueued_total";
    pub const JOBS_COMPLETED: &str = "jobs_completed_total";
    pub const JOBS_FAILED: &str = "jobs_failed_total";
    pub const JOB_DURATION: &str = "job_processing_duration_ms";
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const ERROR_RATE: &str = "queue_error_rate_percent";
    pub const ACTIVE_WORKERS: &str = "active_workers";
    pub const DLQ_COUNT: &str = "dlq_current_count";
    pub const STALLED_JOBS: &str = "stalled_jobs_total";
    pub const POLLING_REMOVED: &str = "polling_removed_total";
}

/// Install the Prometheus recorder. Call once at startup; later calls
/// return the same handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// The global Prometheus handle, if metrics have been initialized.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

pub fn record_enqueued(class: &str) {
    counter!(names::JOBS_ENQUEUED, "class" => class.to_string()).increment(1);
}

pub fn record_completed(class: &str) {
    counter!(names::JOBS_COMPLETED, "class" => class.to_string()).increment(1);
}

pub fn record_failed(class: &str, error_type: &str) {
    counter!(
        names::JOBS_FAILED,
        "class" => class.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

pub fn record_job_duration(class: &str, success: bool, duration: Duration) {
    histogram!(
        names::JOB_DURATION,
        "class" => class.to_string(),
        "success" => if success { "true" } else { "false" }
    )
    .record(duration.as_secs_f64() * 1_000.0);
}

pub fn set_queue_depth(class: &str, state: &str, depth: f64) {
    gauge!(
        names::QUEUE_DEPTH,
        "class" => class.to_string(),
        "state" => state.to_string()
    )
    .set(depth);
}

pub fn set_error_rate(percent: f64) {
    gauge!(names::ERROR_RATE).set(percent);
}

pub fn set_active_workers(class: &str, count: f64) {
    gauge!(names::ACTIVE_WORKERS, "class" => class.to_string()).set(count);
}

pub fn set_dlq_count(count: f64) {
    gauge!(names::DLQ_COUNT).set(count);
}

pub fn record_stalled(count: u64) {
    counter!(names::STALLED_JOBS).increment(count);
}

/// Reasons the polling loop removes a job outright.
#[derive(Debug, Clone, Copy)]
pub enum RemovalReason {
    UnknownClass,
    CorruptPayload,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownClass => "unknown_class",
            Self::CorruptPayload => "corrupt_payload",
        }
    }
}

pub fn record_polling_removed(reason: RemovalReason) {
    counter!(names::POLLING_REMOVED, "reason" => reason.as_str().to_string()).increment(1);
}
