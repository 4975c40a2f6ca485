//! Lifecycle supervisor: ordered initialization with structured
//! diagnostics, and graceful drain with a deadline on the way down.
//!
//! The supervisor is the sole owner of the worker pools and timers and the
//! only entity permitted to initiate teardown.

use crate::admin::{admin_router, AdminState};
use crate::circuit::CircuitBreakerSnapshot;
use crate::dlq::DlqManager;
use crate::error::EngineError;
use crate::handler::HandlerRegistry;
use crate::health::HealthMonitor;
use crate::job::{CleanupPayload, EnqueueOptions, JobClass, JobPayload, JobPriority, JobState};
use crate::observer::QueueObserver;
use crate::poller::PollingLoop;
use crate::producer::EnqueueProducer;
use crate::queue::QueueCore;
use crate::session::TenantSessionProvider;
use crate::settings::EngineSettings;
use crate::worker::Dispatcher;
use database::redis::{ConnectionHub, UsageClass};
use database::DatabaseError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Terminal jobs older than this are purged by the startup cleanup pass.
const STARTUP_CLEAN_AGE_MS: u64 = 24 * 60 * 60 * 1000;
const STARTUP_CLEAN_LIMIT: u64 = 1_000;

/// Lease-expired actives reclaimed per class at startup.
const STARTUP_RECLAIM_LIMIT: u64 = 100;

/// Initialization steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    ConnectionManager,
    ConnectivityProbe,
    QueueCore,
    ObserverSubscriptions,
    HandlerRegistration,
    WorkerPools,
    StartupMaintenance,
    Monitoring,
    PollingLoop,
}

impl InitStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionManager => "connection-manager",
            Self::ConnectivityProbe => "connectivity-probe",
            Self::QueueCore => "queue-core",
            Self::ObserverSubscriptions => "observer-subscriptions",
            Self::HandlerRegistration => "handler-registration",
            Self::WorkerPools => "worker-pools",
            Self::StartupMaintenance => "startup-maintenance",
            Self::Monitoring => "monitoring",
            Self::PollingLoop => "polling-loop",
        }
    }
}

impl std::fmt::Display for InitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the process manager receives when initialization aborts.
#[derive(Debug)]
pub struct InitDiagnostics {
    pub failed_step: InitStep,
    pub error: EngineError,
    pub breakers: Vec<CircuitBreakerSnapshot>,
}

impl std::fmt::Display for InitDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "initialization failed at step '{}': {}",
            self.failed_step, self.error
        )
    }
}

impl std::error::Error for InitDiagnostics {}

/// The running engine.
pub struct EngineSupervisor {
    settings: EngineSettings,
    hub: Arc<ConnectionHub>,
    queue: Arc<QueueCore>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
    poller: Arc<PollingLoop>,
    monitor: Arc<HealthMonitor>,
    dlq: Arc<DlqManager>,
    producer: EnqueueProducer,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl EngineSupervisor {
    /// Bring the engine up in dependency order. Every step must succeed or
    /// the whole initialization aborts with a diagnostics bundle naming the
    /// failing step and the circuit-breaker states.
    pub async fn initialize(
        settings: EngineSettings,
        registry: HandlerRegistry,
        sessions: Arc<dyn TenantSessionProvider>,
        observers: Vec<Arc<dyn QueueObserver>>,
    ) -> Result<Self, Box<InitDiagnostics>> {
        let registry = Arc::new(registry);
        let diagnose = |step: InitStep, error: EngineError, registry: &HandlerRegistry| {
            error!(step = %step, error = %error, "Engine initialization failed");
            Box::new(InitDiagnostics {
                failed_step: step,
                error,
                breakers: registry.breaker_snapshots(),
            })
        };

        info!(queue = %settings.queue_name, "Initializing job engine");

        // Connection manager and connectivity probe.
        let hub = Arc::new(ConnectionHub::new(settings.redis.clone()));
        let conn = match hub.get(UsageClass::QueueBackend).await {
            Ok(conn) => conn,
            Err(e) => {
                return Err(diagnose(
                    InitStep::ConnectionManager,
                    EngineError::Database(e),
                    &registry,
                ))
            }
        };
        let probe = hub.health_check(UsageClass::QueueBackend).await;
        if !probe.healthy {
            return Err(diagnose(
                InitStep::ConnectivityProbe,
                EngineError::Database(DatabaseError::HealthCheckFailed(
                    probe.message.unwrap_or_else(|| "no response".to_string()),
                )),
                &registry,
            ));
        }

        // Queue core bound to the queue-backend handle.
        let queue = Arc::new(QueueCore::new(conn.clone(), &settings.queue_name));

        // Observer subscriptions, before any worker can produce events.
        for observer in observers {
            queue.subscribe(observer);
        }

        // Handler registration happened against the registry up front;
        // validate the dispatch table before any pool spawns against it.
        if registry.is_empty() {
            return Err(diagnose(
                InitStep::HandlerRegistration,
                EngineError::Config("no job handlers registered".to_string()),
                &registry,
            ));
        }

        // Worker pools.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&sessions),
            shutdown_rx.clone(),
        ));
        dispatcher.start();

        // Startup maintenance: reclaim leases orphaned by a previous crash,
        // then purge old terminal jobs.
        for class in JobClass::ALL {
            if let Err(e) = queue.requeue_expired(class, STARTUP_RECLAIM_LIMIT).await {
                return Err(diagnose(InitStep::StartupMaintenance, e, &registry));
            }
        }
        for state in [JobState::Completed, JobState::Failed] {
            if let Err(e) = queue
                .clean(STARTUP_CLEAN_AGE_MS, STARTUP_CLEAN_LIMIT, state)
                .await
            {
                return Err(diagnose(InitStep::StartupMaintenance, e, &registry));
            }
        }

        // Monitoring timers.
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&queue),
            Arc::clone(&hub),
            Arc::clone(&dispatcher),
            registry.classes(),
            settings.monitor_config(),
            shutdown_rx.clone(),
        ));
        monitor.spawn();

        // Polling fallback loop.
        let poller = Arc::new(PollingLoop::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            sessions,
            shutdown_rx,
            settings.poll_interval_ms,
        ));
        poller.spawn();

        let dlq = Arc::new(DlqManager::new(conn, Arc::clone(&queue)));

        let producer =
            EnqueueProducer::detached(settings.default_backoff_base_ms, settings.default_max_attempts);
        producer.bind(Arc::clone(&queue));

        let supervisor = Self {
            settings,
            hub,
            queue,
            registry,
            dispatcher,
            poller,
            monitor,
            dlq,
            producer,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        };
        supervisor.maybe_inject_probe_job();

        info!(
            classes = supervisor.registry.len(),
            "Job engine initialized"
        );
        Ok(supervisor)
    }

    /// Inject a synthetic probe job one second after initialization when
    /// `ENABLE_QUEUE_TESTS` is set outside production.
    fn maybe_inject_probe_job(&self) {
        if !self.settings.probe_job_enabled() {
            return;
        }
        if !self.registry.contains(JobClass::Cleanup) {
            debug!("Probe job requested but no cleanup handler registered; skipping");
            return;
        }

        let producer = self.producer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let ack = producer
                .enqueue(
                    JobPayload::Cleanup(CleanupPayload {
                        target: "startup-probe".to_string(),
                        older_than_ms: None,
                    }),
                    None,
                    EnqueueOptions {
                        priority: Some(JobPriority::Low),
                        ..Default::default()
                    },
                )
                .await;
            if ack.ok {
                info!(job_id = ?ack.job_id, "Injected startup probe job");
            } else {
                warn!(error = ?ack.error, "Failed to inject startup probe job");
            }
        });
    }

    /// Enqueue handle for the ingress layers. Cheap to clone.
    pub fn producer(&self) -> EnqueueProducer {
        self.producer.clone()
    }

    pub fn queue(&self) -> Arc<QueueCore> {
        Arc::clone(&self.queue)
    }

    pub fn poller(&self) -> Arc<PollingLoop> {
        Arc::clone(&self.poller)
    }

    pub fn monitor(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn dlq(&self) -> Arc<DlqManager> {
        Arc::clone(&self.dlq)
    }

    /// Jobs currently being processed.
    pub fn active_jobs(&self) -> usize {
        self.dispatcher.active_jobs()
    }

    /// Build the admin HTTP router for this engine.
    pub fn admin_router(
        &self,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> axum::Router {
        admin_router(AdminState {
            queue: Arc::clone(&self.queue),
            monitor: Arc::clone(&self.monitor),
            dlq: Arc::clone(&self.dlq),
            hub: Arc::clone(&self.hub),
            app_name: app_name.into(),
            app_version: app_version.into(),
        })
    }

    /// Graceful shutdown with the configured deadline.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_with_deadline(self.settings.shutdown_deadline_ms)
            .await
    }

    /// Graceful shutdown: stop timers and the polling loop, stop pulling,
    /// wait for active jobs up to the deadline, close the queue and every
    /// connection. Idempotent; errors on the way down are logged at warn
    /// and never re-thrown. Returns whether the drain completed.
    pub async fn shutdown_with_deadline(&self, deadline_ms: u64) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return true;
        }

        info!(deadline_ms, "Engine shutdown starting");

        self.monitor.stop();
        self.poller.stop();
        if self.shutdown_tx.send(true).is_err() {
            warn!("Shutdown signal had no receivers");
        }

        let deadline = Duration::from_millis(deadline_ms);
        let drain = self.dispatcher.drain(deadline);
        tokio::pin!(drain);

        let drained = loop {
            tokio::select! {
                drained = &mut drain => break drained,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let mut remaining = 0;
                    for class in self.registry.classes() {
                        match self.queue.fetch_active(class, 10).await {
                            Ok(jobs) => remaining += jobs.len(),
                            Err(e) => warn!(class = %class, error = %e, "Active inspection failed during drain"),
                        }
                    }
                    info!(active = remaining, "Waiting for active jobs to finish");
                }
            }
        };

        self.producer.close();
        if !drained {
            warn!(
                deadline_ms,
                "Drain deadline expired; force-closing. Abandoned jobs revert to waiting on lease expiry"
            );
        }

        self.hub.close_all().await;
        info!(drained, "Engine shutdown complete");
        drained
    }
}
