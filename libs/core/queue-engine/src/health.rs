//! Health monitoring: periodic Redis checks, stalled-job detection, and the
//! operator-facing health report with its fixed recommendation rule set.

use crate::job::JobClass;
use crate::metrics;
use crate::queue::{QueueCore, QueueStatsSnapshot};
use crate::worker::Dispatcher;
use chrono::Utc;
use database::redis::{ConnectionHub, UsageClass};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Monitor cadences and thresholds.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub queue_health_interval_ms: u64,
    pub worker_health_interval_ms: u64,
    /// An active job older than this is flagged stalled.
    pub stalled_threshold_ms: i64,
    /// Idle time after which waiting work with no activity means the
    /// workers are considered dead.
    pub dead_worker_idle_ms: i64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            queue_health_interval_ms: 30_000,
            worker_health_interval_ms: 60_000,
            stalled_threshold_ms: 120_000,
            dead_worker_idle_ms: 300_000,
        }
    }
}

/// Redis reachability as seen by the last check.
#[derive(Debug, Clone, Serialize)]
pub struct RedisHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub message: Option<String>,
}

/// Dispatcher status surfaced in the health report.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub started: bool,
    pub active_jobs: usize,
    pub registered_classes: Vec<JobClass>,
}

/// Operator-facing health read.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub redis: RedisHealth,
    pub stats: QueueStatsSnapshot,
    pub worker_status: WorkerStatus,
    pub recommendations: Vec<String>,
}

pub const REC_RESTART_WORKERS: &str = "restart workers required";
pub const REC_WORKERS_DEAD: &str = "workers dead";
pub const REC_BACKLOG: &str = "backlog accumulating";
pub const REC_HIGH_ERROR_RATE: &str = "high error rate";
pub const REC_MORE_FAILURES: &str = "more failures than successes";
pub const REC_HEALTHY: &str = "system healthy";

/// Compose the deterministic recommendation list from queue stats.
///
/// `processing` is whether the dispatcher is started and pulling.
pub fn recommendations(
    stats: &QueueStatsSnapshot,
    processing: bool,
    now_ms: i64,
) -> Vec<String> {
    let mut out = Vec::new();
    let totals = &stats.totals;
    let last_age = stats.last_processed_at.map(|at| now_ms - at);

    if totals.delayed > 0 && !processing && totals.active == 0 {
        out.push(REC_RESTART_WORKERS.to_string());
    }
    if totals.waiting > 10
        && totals.active == 0
        && last_age.is_none_or(|age| age > 120_000)
    {
        out.push(REC_WORKERS_DEAD.to_string());
    }
    if totals.waiting > 100 && totals.active == 0 {
        out.push(REC_BACKLOG.to_string());
    }
    if stats.error_rate_percent > 10.0 {
        out.push(REC_HIGH_ERROR_RATE.to_string());
    }
    if totals.failed > totals.completed {
        out.push(REC_MORE_FAILURES.to_string());
    }
    if out.is_empty() {
        out.push(REC_HEALTHY.to_string());
    }
    out
}

/// Runs the queue-health and worker-health timers and serves health reads.
pub struct HealthMonitor {
    queue: Arc<QueueCore>,
    hub: Arc<ConnectionHub>,
    dispatcher: Arc<Dispatcher>,
    config: HealthMonitorConfig,
    registered_classes: Vec<JobClass>,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        queue: Arc<QueueCore>,
        hub: Arc<ConnectionHub>,
        dispatcher: Arc<Dispatcher>,
        registered_classes: Vec<JobClass>,
        config: HealthMonitorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            hub,
            dispatcher,
            config,
            registered_classes,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start both monitoring timers.
    pub fn spawn(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }

        let monitor = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            monitor.run_queue_health().await;
        }));

        let monitor = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            monitor.run_worker_health().await;
        }));

        info!(
            queue_interval_ms = self.config.queue_health_interval_ms,
            worker_interval_ms = self.config.worker_health_interval_ms,
            "Health monitoring started"
        );
    }

    /// Halt the monitoring timers.
    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    async fn run_queue_health(&self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(Duration::from_millis(self.config.queue_health_interval_ms)) => {}
            }
            self.queue_health_tick().await;
        }
    }

    async fn queue_health_tick(&self) {
        let status = self.hub.health_check(UsageClass::QueueBackend).await;
        if !status.healthy {
            warn!(
                message = status.message.as_deref().unwrap_or("unknown"),
                latency_ms = status.latency_ms,
                "Queue Redis unhealthy; requesting fresh handle"
            );
            match self.hub.refresh(UsageClass::QueueBackend).await {
                Ok(conn) => self.queue.replace_connection(conn),
                Err(e) => warn!(error = %e, "Failed to refresh queue connection"),
            }
        }

        match self.queue.stats().await {
            Ok(stats) => {
                if stats.error_rate_percent > 20.0 {
                    warn!(
                        error_rate = stats.error_rate_percent,
                        "Queue error rate above 20%"
                    );
                }
                if stats.totals.waiting > 1_000 {
                    warn!(waiting = stats.totals.waiting, "Waiting depth above 1000");
                }
            }
            Err(e) => warn!(error = %e, "Failed to compute queue stats"),
        }
    }

    async fn run_worker_health(&self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(Duration::from_millis(self.config.worker_health_interval_ms)) => {}
            }
            self.worker_health_tick().await;
        }
    }

    async fn worker_health_tick(&self) {
        let now = Utc::now().timestamp_millis();

        let mut stalled: Vec<String> = Vec::new();
        for class in JobClass::ALL {
            match self.queue.fetch_active(class, 50).await {
                Ok(jobs) => {
                    for job in jobs {
                        if let Some(dispatched_at) = job.dispatched_at {
                            if now - dispatched_at > self.config.stalled_threshold_ms {
                                stalled.push(job.id);
                            }
                        }
                    }
                }
                Err(e) => warn!(class = %class, error = %e, "Failed to inspect active jobs"),
            }
        }

        if !stalled.is_empty() {
            let preview: Vec<&str> = stalled.iter().take(5).map(String::as_str).collect();
            warn!(
                count = stalled.len(),
                ids = ?preview,
                "Stalled jobs detected"
            );
            metrics::record_stalled(stalled.len() as u64);
            self.queue.notify_stalled(&stalled);
        }

        match self.queue.stats().await {
            Ok(stats) => {
                let idle = stats
                    .last_processed_at
                    .map(|at| now - at)
                    .unwrap_or(i64::MAX);
                if stats.totals.waiting > 10
                    && stats.totals.active == 0
                    && idle > self.config.dead_worker_idle_ms
                {
                    error!(
                        waiting = stats.totals.waiting,
                        idle_ms = if idle == i64::MAX { -1 } else { idle },
                        "CRITICAL: workers appear dead; waiting jobs are not being processed"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to compute queue stats"),
        }
    }

    /// Compose the full health report. Recomputed on every call.
    pub async fn get_health(&self) -> HealthReport {
        let status = self.hub.health_check(UsageClass::QueueBackend).await;
        let redis = RedisHealth {
            healthy: status.healthy,
            latency_ms: status.latency_ms,
            message: status.message,
        };

        let now = Utc::now().timestamp_millis();
        let processing = self.dispatcher.is_started() && !*self.shutdown.borrow();

        match self.queue.stats().await {
            Ok(stats) => {
                let recommendations = recommendations(&stats, processing, now);
                let healthy = redis.healthy
                    && recommendations.len() == 1
                    && recommendations[0] == REC_HEALTHY;
                HealthReport {
                    healthy,
                    redis,
                    worker_status: WorkerStatus {
                        started: self.dispatcher.is_started(),
                        active_jobs: self.dispatcher.active_jobs(),
                        registered_classes: self.registered_classes.clone(),
                    },
                    stats,
                    recommendations,
                }
            }
            Err(e) => HealthReport {
                healthy: false,
                redis,
                worker_status: WorkerStatus {
                    started: self.dispatcher.is_started(),
                    active_jobs: self.dispatcher.active_jobs(),
                    registered_classes: self.registered_classes.clone(),
                },
                stats: QueueStatsSnapshot {
                    per_class: Vec::new(),
                    totals: Default::default(),
                    error_rate_percent: 0.0,
                    last_processed_at: None,
                    worker_utilization: 0.0,
                },
                recommendations: vec![format!("stats unavailable: {}", e)],
            },
        }
    }
}
