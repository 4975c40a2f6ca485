//! Dispatcher and per-class worker pools.
//!
//! Each registered job class gets a puller task running up to N concurrent
//! workers (a `JoinSet` bounded by a `Semaphore`). A worker iteration is:
//! pull via CAS, open the tenant session, invoke the breaker-guarded handler
//! under its labeled timeout, report the terminal state back to the Queue
//! Core. Cancellation is cooperative: the shutdown watch channel is checked
//! between pulls and surfaced to handlers through [`HandlerContext`].

use crate::error::ErrorCategory;
use crate::handler::{HandlerContext, HandlerEntry, HandlerRegistry};
use crate::job::{Job, JobClass};
use crate::metrics;
use crate::queue::QueueCore;
use crate::session::TenantSessionProvider;
use crate::timeout::with_timeout;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// How often an idle pool re-checks the waiting set. Push notifications from
/// hosted Redis are unreliable, so the pull cadence has to be tight enough
/// for interactive traffic on its own.
const PULL_INTERVAL_MS: u64 = 100;

/// Backoff after a Redis error in the pull loop.
const PULL_ERROR_BACKOFF_MS: u64 = 1_000;

/// Runs the worker pools for every registered job class.
pub struct Dispatcher {
    queue: Arc<QueueCore>,
    registry: Arc<HandlerRegistry>,
    sessions: Arc<dyn TenantSessionProvider>,
    shutdown: watch::Receiver<bool>,
    started: AtomicBool,
    pools: Mutex<Vec<(JoinHandle<()>, AbortHandle)>>,
    in_flight: Vec<(JobClass, Arc<AtomicUsize>)>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<QueueCore>,
        registry: Arc<HandlerRegistry>,
        sessions: Arc<dyn TenantSessionProvider>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let in_flight = registry
            .classes()
            .into_iter()
            .map(|class| (class, Arc::new(AtomicUsize::new(0))))
            .collect();
        Self {
            queue,
            registry,
            sessions,
            shutdown,
            started: AtomicBool::new(false),
            pools: Mutex::new(Vec::new()),
            in_flight,
        }
    }

    /// Begin dispatch on all registered classes. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut pools = self.pools.lock().unwrap();
        for (class, counter) in &self.in_flight {
            let Some(entry) = self.registry.get(*class) else {
                continue;
            };
            let pool = PoolContext {
                class: *class,
                entry: entry.clone(),
                queue: Arc::clone(&self.queue),
                sessions: Arc::clone(&self.sessions),
                shutdown: self.shutdown.clone(),
                in_flight: Arc::clone(counter),
            };
            info!(
                class = %class,
                concurrency = entry.concurrency,
                handler = entry.handler.name(),
                "Starting worker pool"
            );
            let handle = tokio::spawn(pool.run());
            let abort = handle.abort_handle();
            pools.push((handle, abort));
        }
    }

    /// Jobs currently being processed across all pools.
    pub fn active_jobs(&self) -> usize {
        self.in_flight
            .iter()
            .map(|(_, counter)| counter.load(Ordering::SeqCst))
            .sum()
    }

    /// Active job count for one class.
    pub fn active_jobs_for(&self, class: JobClass) -> usize {
        self.in_flight
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, counter)| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Wait for the pools to finish after the shutdown signal, up to the
    /// deadline. Returns true iff every in-flight job completed. On deadline
    /// expiry the pools are aborted; their jobs' leases expire server-side
    /// and return them to `waiting`.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let handles: Vec<(JoinHandle<()>, AbortHandle)> =
            std::mem::take(&mut *self.pools.lock().unwrap());

        let start = std::time::Instant::now();
        let mut drained = true;
        for (handle, abort) in handles {
            let remaining = deadline.saturating_sub(start.elapsed());
            match tokio::time::timeout(remaining, handle).await {
                Ok(_) => {}
                Err(_) => {
                    drained = false;
                    abort.abort();
                }
            }
        }

        if drained {
            info!("Worker pools drained cleanly");
        } else {
            warn!(
                deadline_ms = deadline.as_millis() as u64,
                "Drain deadline expired; abandoning remaining workers"
            );
        }
        drained
    }
}

/// Everything one class's pool needs, owned by its task.
struct PoolContext {
    class: JobClass,
    entry: HandlerEntry,
    queue: Arc<QueueCore>,
    sessions: Arc<dyn TenantSessionProvider>,
    shutdown: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
}

impl PoolContext {
    async fn run(self) {
        let worker_base = format!("worker-{}-{}", self.class, uuid::Uuid::new_v4());
        let semaphore = Arc::new(Semaphore::new(self.entry.concurrency));
        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reap finished workers without blocking.
            while join_set.try_join_next().is_some() {}

            // An open circuit means the collaborator is down: stop pulling
            // so jobs stay `waiting` instead of burning attempts.
            if !self.entry.breaker.can_execute() {
                debug!(class = %self.class, "Circuit open; pausing pulls");
                if sleep_or_shutdown(&mut shutdown, PULL_INTERVAL_MS * 10).await {
                    break;
                }
                continue;
            }

            let free = semaphore.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = join_set.join_next() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let jobs = match self.queue.pop_waiting(self.class, free, &worker_base).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(class = %self.class, error = %e, "Pull failed; backing off");
                    if sleep_or_shutdown(&mut shutdown, PULL_ERROR_BACKOFF_MS).await {
                        break;
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                if sleep_or_shutdown(&mut shutdown, PULL_INTERVAL_MS).await {
                    break;
                }
                continue;
            }

            for job in jobs {
                // Permits were free when we popped; this cannot block long.
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                let ctx = HandlerContext::new(self.shutdown.clone());
                let entry = self.entry.clone();
                let queue = Arc::clone(&self.queue);
                let sessions = Arc::clone(&self.sessions);
                let in_flight = Arc::clone(&self.in_flight);
                let class = self.class;

                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::set_active_workers(class.as_str(), current as f64);

                join_set.spawn(async move {
                    process_job(&queue, &entry, sessions.as_ref(), &ctx, &job).await;
                    let current = in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                    metrics::set_active_workers(class.as_str(), current as f64);
                    drop(permit);
                });
            }
        }

        // Stop pulling, finish what's in flight. The drain deadline is
        // enforced by Dispatcher::drain aborting this task.
        while join_set.join_next().await.is_some() {}
        info!(class = %self.class, "Worker pool stopped");
    }
}

/// Sleep unless shutdown fires first. Returns true when shutting down.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, ms: u64) -> bool {
    tokio::select! {
        _ = shutdown.changed() => *shutdown.borrow(),
        _ = tokio::time::sleep(Duration::from_millis(ms)) => false,
    }
}

/// The single dispatch pipeline: tenant session, breaker-guarded handler
/// under its class timeout, terminal report. Shared verbatim by the
/// dispatcher pools and the polling fallback loop so both paths behave
/// identically.
///
/// The caller must already own the job (CAS-acquired `active`).
pub(crate) async fn process_job(
    queue: &QueueCore,
    entry: &HandlerEntry,
    sessions: &dyn TenantSessionProvider,
    ctx: &HandlerContext,
    job: &Job,
) {
    let start = std::time::Instant::now();

    let mut session = match sessions
        .acquire(job.class.session_kind(), job.merchant_id.as_deref())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            // Infrastructure failure before the handler ran; retryable.
            warn!(job_id = %job.id, class = %job.class, error = %e, "Tenant session acquisition failed");
            report_failure(queue, job, &format!("session: {}", e), e.category()).await;
            return;
        }
    };

    let label = format!("{}-handler", job.class);
    let budget_ms = job.class.handler_timeout_ms();
    let attempt = with_timeout(
        async { Ok(entry.handler.handle(ctx, session.as_mut(), job).await) },
        budget_ms,
        &label,
    )
    .await;

    // Release on every exit path, including timeout and cancellation.
    session.release().await;

    match attempt {
        Ok(Ok(result)) => {
            entry.breaker.record_success();
            metrics::record_job_duration(job.class.as_str(), true, start.elapsed());
            if let Err(e) = queue.mark_completed(job, &result).await {
                error!(job_id = %job.id, class = %job.class, error = %e, "Failed to record completion");
            }
        }
        Ok(Err(handler_err)) => {
            entry.breaker.record_failure();
            metrics::record_job_duration(job.class.as_str(), false, start.elapsed());
            debug!(
                job_id = %job.id,
                class = %job.class,
                attempt = job.attempts_made,
                error = %handler_err,
                "Handler failed"
            );
            report_failure(queue, job, &handler_err.to_string(), handler_err.category()).await;
        }
        Err(engine_err) => {
            // Timeout fired; the handler future was dropped at the await.
            entry.breaker.record_failure();
            metrics::record_job_duration(job.class.as_str(), false, start.elapsed());
            warn!(
                job_id = %job.id,
                class = %job.class,
                budget_ms,
                "Handler invocation timed out"
            );
            report_failure(queue, job, &engine_err.to_string(), engine_err.category()).await;
        }
    }
}

async fn report_failure(queue: &QueueCore, job: &Job, error: &str, category: ErrorCategory) {
    let retry = category.should_retry();
    if let Err(e) = queue.mark_failed(job, error, category, retry).await {
        error!(job_id = %job.id, class = %job.class, error = %e, "Failed to record failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_or_shutdown_times_out_without_signal() {
        let (_tx, mut rx) = watch::channel(false);
        let start = std::time::Instant::now();
        let shutting_down = sleep_or_shutdown(&mut rx, 20).await;
        assert!(!shutting_down);
        assert!(start.elapsed().as_millis() >= 15);
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown_wakes_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
        });
        let shutting_down = sleep_or_shutdown(&mut rx, 10_000).await;
        assert!(shutting_down);
    }
}
