//! Manual polling fallback loop.
//!
//! Hosted Redis can silently drop keyspace notifications, leaving jobs
//! enqueued but never pulled. This loop periodically scans queue state
//! directly: it promotes due delayed jobs, removes corrupt or unroutable
//! records, and drains a bounded slice of the waiting sets through the same
//! dispatch pipeline the worker pools use.
//!
//! A job the Dispatcher already holds is never double-dispatched: the
//! `waiting → active` transition is a compare-and-set, and the poller skips
//! any job whose CAS it loses.

use crate::error::{EngineError, EngineResult, ErrorCategory};
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::job::{JobClass, JobState};
use crate::metrics::{self, RemovalReason};
use crate::queue::QueueCore;
use crate::session::TenantSessionProvider;
use crate::worker::process_job;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Waiting jobs examined per tick, across all classes.
const WAITING_SCAN_LIMIT: usize = 3;

/// Delayed jobs examined per tick, across all classes.
const DELAYED_SCAN_LIMIT: usize = 2;

/// Pause after a rate-limit-category Redis error.
pub const RATE_LIMIT_BACKOFF_MS: u64 = 300_000;

/// The polling fallback control loop.
pub struct PollingLoop {
    queue: Arc<QueueCore>,
    registry: Arc<HandlerRegistry>,
    sessions: Arc<dyn TenantSessionProvider>,
    shutdown: watch::Receiver<bool>,
    base_interval_ms: u64,
    interval_ms: AtomicU64,
    rate_limit_backoff_ms: u64,
    paused: AtomicBool,
    alert_sent: AtomicBool,
    alerts_emitted: AtomicU64,
    resume: Notify,
    reschedule: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
    worker_id: String,
}

impl PollingLoop {
    pub fn new(
        queue: Arc<QueueCore>,
        registry: Arc<HandlerRegistry>,
        sessions: Arc<dyn TenantSessionProvider>,
        shutdown: watch::Receiver<bool>,
        poll_interval_ms: u64,
    ) -> Self {
        Self {
            queue,
            registry,
            sessions,
            shutdown,
            base_interval_ms: poll_interval_ms,
            interval_ms: AtomicU64::new(poll_interval_ms),
            rate_limit_backoff_ms: RATE_LIMIT_BACKOFF_MS,
            paused: AtomicBool::new(false),
            alert_sent: AtomicBool::new(false),
            alerts_emitted: AtomicU64::new(0),
            resume: Notify::new(),
            reschedule: Notify::new(),
            handle: Mutex::new(None),
            worker_id: format!("poller-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Override the rate-limit pause (tests use a short one).
    pub fn with_rate_limit_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.rate_limit_backoff_ms = backoff_ms;
        self
    }

    /// Start the loop task.
    pub fn spawn(self: &Arc<Self>) {
        let mut slot = self.handle.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(this.run()));
    }

    /// Halt the loop task. Used by the lifecycle supervisor during
    /// shutdown, after the shutdown signal has been sent.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Engage the adaptive throttle after a provider rate-limit signal:
    /// the timer halts and an operations alert is emitted exactly once per
    /// sustained outage. The loop reschedules itself after the backoff, or
    /// earlier via [`PollingLoop::resume_now`].
    pub fn notify_rate_limited(&self, cause: &str) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.alert_sent.swap(true, Ordering::SeqCst) {
            self.alerts_emitted.fetch_add(1, Ordering::SeqCst);
            error!(
                cause,
                backoff_ms = self.rate_limit_backoff_ms,
                "OPERATIONS ALERT: Redis rate limit hit; manual polling paused"
            );
        }
        // Wake the run loop out of its interval sleep into the pause wait.
        self.reschedule.notify_one();
    }

    /// Re-enable the loop immediately after a rate-limit pause. No-op while
    /// the loop is running normally.
    pub fn resume_now(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.alert_sent.store(false, Ordering::SeqCst);
            info!("Manual polling resumed by request");
            self.resume.notify_one();
        }
    }

    /// Restart the timer at `base_interval_ms * multiplier` for sustained
    /// degraded periods. A multiplier of 1 restores the base cadence.
    pub fn adjust_interval(&self, multiplier: u32) {
        let new_interval = self.base_interval_ms.saturating_mul(multiplier.max(1) as u64);
        let old = self.interval_ms.swap(new_interval, Ordering::SeqCst);
        if old != new_interval {
            info!(old_ms = old, new_ms = new_interval, "Polling interval adjusted");
        }
        self.reschedule.notify_one();
    }

    /// Whether the loop is currently paused by the adaptive throttle.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn current_interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::SeqCst)
    }

    /// Operations alerts emitted so far.
    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        info!(
            interval_ms = self.base_interval_ms,
            "Manual polling loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.paused.load(Ordering::SeqCst) {
                self.wait_out_rate_limit(&mut shutdown).await;
                continue;
            }

            let interval = self.interval_ms.load(Ordering::SeqCst);
            tokio::select! {
                _ = shutdown.changed() => continue,
                // Interval change or throttle engagement; re-evaluate.
                _ = self.reschedule.notified() => continue,
                _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
            }

            if self.paused.load(Ordering::SeqCst) || *shutdown.borrow() {
                continue;
            }

            match self.tick().await {
                Ok(()) => {}
                Err(e) if e.is_rate_limited() => {
                    self.notify_rate_limited(&e.to_string());
                }
                Err(e) => {
                    warn!(error = %e, "Polling tick failed");
                }
            }
        }

        info!("Manual polling loop stopped");
    }

    /// Sit out the rate-limit backoff (or an explicit resume), then reset
    /// the alert flag so the next sustained outage alerts again.
    async fn wait_out_rate_limit(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => {}
            // resume_now already cleared the flags.
            _ = self.resume.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(self.rate_limit_backoff_ms)) => {
                self.paused.store(false, Ordering::SeqCst);
                self.alert_sent.store(false, Ordering::SeqCst);
                info!("Manual polling resumed after rate-limit backoff");
            }
        }
    }

    /// One scan: promote due delayed jobs, then drain a bounded slice of
    /// the waiting sets. Redis errors propagate so the caller can classify
    /// them (rate limits engage the throttle).
    async fn tick(&self) -> EngineResult<()> {
        let mut delayed_seen = 0;
        for class in JobClass::ALL {
            if delayed_seen >= DELAYED_SCAN_LIMIT {
                break;
            }
            let ids = self
                .queue
                .state_ids(class, JobState::Delayed, DELAYED_SCAN_LIMIT - delayed_seen)
                .await?;
            for id in ids {
                delayed_seen += 1;
                // No-op when the deadline hasn't passed or the dispatcher
                // already promoted it.
                self.queue.promote(class, &id).await?;
            }
        }

        let mut waiting_seen = 0;
        for class in JobClass::ALL {
            if waiting_seen >= WAITING_SCAN_LIMIT {
                break;
            }
            let ids = self
                .queue
                .state_ids(class, JobState::Waiting, WAITING_SCAN_LIMIT - waiting_seen)
                .await?;
            for id in ids {
                waiting_seen += 1;
                self.process_waiting(class, &id).await?;
            }
        }

        Ok(())
    }

    async fn process_waiting(&self, class: JobClass, id: &str) -> EngineResult<()> {
        let job = match self.queue.load_job(class, id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %id, class = %class, "Waiting job has no record; removing");
                self.remove_counted(class, id, RemovalReason::CorruptPayload)
                    .await?;
                return Ok(());
            }
            Err(EngineError::UnknownJobClass(found)) => {
                warn!(job_id = %id, found_class = %found, "Waiting job has unknown class; removing");
                self.remove_counted(class, id, RemovalReason::UnknownClass)
                    .await?;
                return Ok(());
            }
            Err(EngineError::PayloadCorrupt(detail)) => {
                warn!(job_id = %id, class = %class, detail = %detail, "Waiting job payload corrupt; removing");
                self.remove_counted(class, id, RemovalReason::CorruptPayload)
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(entry) = self.registry.get(job.class) else {
            warn!(job_id = %id, class = %job.class, "No handler registered for class; removing");
            self.remove_counted(class, id, RemovalReason::UnknownClass)
                .await?;
            return Ok(());
        };

        if !entry.breaker.can_execute() {
            debug!(job_id = %id, class = %class, "Circuit open; leaving job waiting");
            return Ok(());
        }

        // The class concurrency cap binds the poller too: a saturated pool
        // means the dispatcher is keeping up and this job will be pulled.
        let active = self.queue.counts(job.class).await?.active;
        if active >= entry.concurrency as u64 {
            debug!(job_id = %id, class = %class, "Concurrency budget saturated; leaving job waiting");
            return Ok(());
        }

        match self.queue.acquire(class, id, &self.worker_id).await? {
            Some(acquired) => {
                debug!(job_id = %id, class = %class, "Polling loop dispatching job");
                let ctx = HandlerContext::new(self.shutdown.clone());
                process_job(
                    &self.queue,
                    entry,
                    self.sessions.as_ref(),
                    &ctx,
                    &acquired,
                )
                .await;
            }
            None => {
                debug!(job_id = %id, class = %class, "Lost acquisition race; skipping");
            }
        }
        Ok(())
    }

    /// Remove a job the loop cannot route and count it as a permanent
    /// failure. The handler pipeline is never invoked for these.
    async fn remove_counted(
        &self,
        class: JobClass,
        id: &str,
        reason: RemovalReason,
    ) -> EngineResult<()> {
        self.queue.remove(class, id).await?;
        self.queue.record_window_failure();
        metrics::record_polling_removed(reason);
        metrics::record_failed(class.as_str(), ErrorCategory::Permanent.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_limits() {
        // The per-tick bounds are deliberately small: the loop is a safety
        // net, not the primary drain path.
        assert_eq!(WAITING_SCAN_LIMIT, 3);
        assert_eq!(DELAYED_SCAN_LIMIT, 2);
        assert_eq!(RATE_LIMIT_BACKOFF_MS, 300_000);
    }
}
