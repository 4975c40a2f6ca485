//! Queue Core: the single owner of all job state.
//!
//! State lives in Redis, per class `C` under the queue namespace `Q`:
//!
//! ```text
//! Q:C:waiting    ZSET  score = priority * 1e13 + enqueued_at
//! Q:C:delayed    ZSET  score = delay_until
//! Q:C:active     ZSET  score = lease deadline
//! Q:C:completed  ZSET  score = completed_at (count-bounded)
//! Q:C:failed     ZSET  score = failed_at    (count-bounded)
//! Q:C:job:{id}   HASH  full job record
//! Q:last-processed    most recent terminal transition (epoch millis)
//! ```
//!
//! Every state transition is a single Lua script, so concurrent writers
//! (dispatcher workers, the polling loop, a second engine instance sharing
//! the Redis) reconcile through compare-and-set semantics: exactly one
//! caller wins `waiting → active`, the rest observe the loss and skip.

use crate::error::{EngineError, EngineResult, ErrorCategory};
use crate::job::{Job, JobClass, JobState};
use crate::metrics;
use crate::observer::QueueObserver;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Default worker lease on an active job. A crashed worker's job returns to
/// `waiting` once the lease deadline passes and a reclaim pass runs.
pub const DEFAULT_LEASE_MS: u64 = 180_000;

/// CAS `waiting → active` for one job id.
/// KEYS: waiting, active, job. ARGV: id, now_ms, lease_deadline, worker_id.
/// Returns 1 = acquired, 0 = lost the race, -1 = record missing (dropped).
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if redis.call('EXISTS', KEYS[3]) == 0 then
  return -1
end
redis.call('HSET', KEYS[3], 'state', 'active', 'dispatched_at', ARGV[2], 'worker_id', ARGV[4])
redis.call('HINCRBY', KEYS[3], 'attempts_made', 1)
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

/// Pop up to N eligible jobs from the head of the waiting set.
/// KEYS: waiting, active. ARGV: count, now_ms, lease_deadline, job_prefix, worker_id.
/// Returns the acquired ids (record-less ids are dropped from the set).
const POP_SCRIPT: &str = r#"
local ids = redis.call('ZRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)
local taken = {}
for _, id in ipairs(ids) do
  if redis.call('ZREM', KEYS[1], id) == 1 then
    local jk = ARGV[4] .. id
    if redis.call('EXISTS', jk) == 1 then
      redis.call('HSET', jk, 'state', 'active', 'dispatched_at', ARGV[2], 'worker_id', ARGV[5])
      redis.call('HINCRBY', jk, 'attempts_made', 1)
      redis.call('ZADD', KEYS[2], ARGV[3], id)
      table.insert(taken, id)
    end
  end
end
return taken
"#;

/// Promote `delayed → waiting` when due.
/// KEYS: delayed, waiting, job. ARGV: id, now_ms.
/// Returns 1 = promoted, 0 = not in delayed (idempotent), -1 = not yet due.
const PROMOTE_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then return 0 end
if tonumber(score) > tonumber(ARGV[2]) then return -1 end
local pri = tonumber(redis.call('HGET', KEYS[3], 'priority') or '3')
local enq = tonumber(redis.call('HGET', KEYS[3], 'enqueued_at') or ARGV[2])
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], pri * 1e13 + enq, ARGV[1])
redis.call('HSET', KEYS[3], 'state', 'waiting', 'delay_until', '0')
return 1
"#;

/// Terminal `→ completed` with count-bounded retention.
/// KEYS: active, completed, job, last_processed.
/// ARGV: id, now_ms, retention_cap, job_prefix, result_json.
/// Returns 1 = transitioned, 0 = already completed (idempotent no-op).
const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], 'state') == 'completed' then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[3], 'state', 'completed', 'completed_at', ARGV[2], 'result', ARGV[5])
redis.call('HDEL', KEYS[3], 'last_error', 'worker_id')
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('SET', KEYS[4], ARGV[2])
local excess = redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[3])
if excess > 0 then
  local evicted = redis.call('ZRANGE', KEYS[2], 0, excess - 1)
  for _, eid in ipairs(evicted) do
    redis.call('DEL', ARGV[4] .. eid)
  end
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, excess - 1)
end
return 1
"#;

/// Retry: `active → delayed` with the next-attempt deadline.
/// KEYS: active, delayed, job. ARGV: id, delay_until, error.
/// Returns 1 = rescheduled, 0 = job is not `active` (already settled,
/// reclaimed, or gone; idempotent no-op). The guard keeps a late or
/// duplicate retry report from resurrecting a job another caller settled.
const RETRY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], 'state') ~= 'active' then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[3], 'state', 'delayed', 'delay_until', ARGV[2], 'last_error', ARGV[3])
redis.call('HDEL', KEYS[3], 'worker_id')
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// Terminal `→ failed` with count-bounded retention.
/// KEYS: active, failed, job, last_processed.
/// ARGV: id, now_ms, retention_cap, job_prefix, error.
/// Returns 1 = transitioned, 0 = already failed (idempotent no-op).
const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], 'state') == 'failed' then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[3], 'state', 'failed', 'completed_at', ARGV[2], 'last_error', ARGV[5])
redis.call('HDEL', KEYS[3], 'worker_id')
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('SET', KEYS[4], ARGV[2])
local excess = redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[3])
if excess > 0 then
  local evicted = redis.call('ZRANGE', KEYS[2], 0, excess - 1)
  for _, eid in ipairs(evicted) do
    redis.call('DEL', ARGV[4] .. eid)
  end
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, excess - 1)
end
return 1
"#;

/// Return lease-expired active jobs to `waiting`.
/// KEYS: active, waiting. ARGV: now_ms, job_prefix, limit.
const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  local jk = ARGV[2] .. id
  if redis.call('EXISTS', jk) == 1 then
    local pri = tonumber(redis.call('HGET', jk, 'priority') or '3')
    local enq = tonumber(redis.call('HGET', jk, 'enqueued_at') or ARGV[1])
    redis.call('HSET', jk, 'state', 'waiting')
    redis.call('HDEL', jk, 'worker_id')
    redis.call('ZADD', KEYS[2], pri * 1e13 + enq, id)
  end
end
return #expired
"#;

/// Age-based purge of a terminal set.
/// KEYS: set. ARGV: cutoff_ms, limit, job_prefix.
const CLEAN_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[3] .. id)
  redis.call('ZREM', KEYS[1], id)
end
return #ids
"#;

/// Key layout under the queue namespace.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    queue: String,
}

impl QueueKeys {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue: queue_name.into(),
        }
    }

    pub fn state_set(&self, class: JobClass, state: JobState) -> String {
        format!("{}:{}:{}", self.queue, class, state)
    }

    pub fn waiting(&self, class: JobClass) -> String {
        self.state_set(class, JobState::Waiting)
    }

    pub fn delayed(&self, class: JobClass) -> String {
        self.state_set(class, JobState::Delayed)
    }

    pub fn active(&self, class: JobClass) -> String {
        self.state_set(class, JobState::Active)
    }

    pub fn completed(&self, class: JobClass) -> String {
        self.state_set(class, JobState::Completed)
    }

    pub fn failed(&self, class: JobClass) -> String {
        self.state_set(class, JobState::Failed)
    }

    pub fn job(&self, class: JobClass, id: &str) -> String {
        format!("{}:{}:job:{}", self.queue, class, id)
    }

    pub fn job_prefix(&self, class: JobClass) -> String {
        format!("{}:{}:job:", self.queue, class)
    }

    pub fn last_processed(&self) -> String {
        format!("{}:last-processed", self.queue)
    }
}

/// Trailing-window success/failure counters for the error rate.
struct ErrorWindow {
    window_size: u32,
    total: AtomicU32,
    failures: AtomicU32,
}

impl ErrorWindow {
    fn new(window_size: u32) -> Self {
        Self {
            window_size,
            total: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }

    fn record(&self, failure: bool) {
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        if failure {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        if total >= self.window_size {
            self.total.store(0, Ordering::SeqCst);
            self.failures.store(0, Ordering::SeqCst);
        }
    }

    fn rate_percent(&self) -> f64 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        let failures = self.failures.load(Ordering::SeqCst);
        failures as f64 / total as f64 * 100.0
    }
}

/// Per-state counts for one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StateCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StateCounts {
    fn add(&mut self, other: &StateCounts) {
        self.waiting += other.waiting;
        self.delayed += other.delayed;
        self.active += other.active;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// Read-only aggregate over all classes; recomputed on demand, never cached.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatsSnapshot {
    pub per_class: Vec<(JobClass, StateCounts)>,
    pub totals: StateCounts,
    pub error_rate_percent: f64,
    pub last_processed_at: Option<i64>,
    /// Occupied fraction of the total concurrency budget (0.0 - 1.0).
    pub worker_utilization: f64,
}

/// Outcome of [`QueueCore::mark_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Rescheduled with backoff; the job is now `delayed`.
    Retried { delay_ms: u64 },
    /// Terminal `failed`.
    Terminal,
    /// The job was already terminal; nothing changed.
    NoOp,
}

/// The Queue Core. The only component permitted to mutate job state.
pub struct QueueCore {
    conn: RwLock<ConnectionManager>,
    keys: QueueKeys,
    lease_ms: u64,
    observers: RwLock<Vec<Arc<dyn QueueObserver>>>,
    error_window: ErrorWindow,
    acquire_script: Script,
    pop_script: Script,
    promote_script: Script,
    complete_script: Script,
    retry_script: Script,
    fail_script: Script,
    reclaim_script: Script,
    clean_script: Script,
}

impl QueueCore {
    pub fn new(conn: ConnectionManager, queue_name: impl Into<String>) -> Self {
        Self {
            conn: RwLock::new(conn),
            keys: QueueKeys::new(queue_name),
            lease_ms: DEFAULT_LEASE_MS,
            observers: RwLock::new(Vec::new()),
            error_window: ErrorWindow::new(100),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            pop_script: Script::new(POP_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            retry_script: Script::new(RETRY_SCRIPT),
            fail_script: Script::new(FAIL_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
            clean_script: Script::new(CLEAN_SCRIPT),
        }
    }

    /// Override the worker lease duration.
    pub fn with_lease_ms(mut self, lease_ms: u64) -> Self {
        self.lease_ms = lease_ms.max(1_000);
        self
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Register a lifecycle observer. Called during initialization, before
    /// workers start.
    pub fn subscribe(&self, observer: Arc<dyn QueueObserver>) {
        self.observers.write().unwrap().push(observer);
    }

    /// Swap in a fresh connection handle (after the health monitor saw a
    /// connection-category failure).
    pub fn replace_connection(&self, conn: ConnectionManager) {
        *self.conn.write().unwrap() = conn;
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.read().unwrap().clone()
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Persist a new job. Returns its 1-based position in the waiting set
    /// (None for delayed jobs).
    pub async fn enqueue(&self, job: &Job) -> EngineResult<Option<u64>> {
        let mut conn = self.connection();
        let job_key = self.keys.job(job.class, &job.id);
        let fields = job.to_hash_fields()?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        {
            let cmd = pipe.cmd("HSET").arg(&job_key);
            for (field, value) in &fields {
                cmd.arg(*field).arg(value);
            }
        }
        match job.state {
            JobState::Delayed => {
                pipe.cmd("ZADD")
                    .arg(self.keys.delayed(job.class))
                    .arg(job.delay_until)
                    .arg(&job.id);
            }
            _ => {
                pipe.cmd("ZADD")
                    .arg(self.keys.waiting(job.class))
                    .arg(job.waiting_score())
                    .arg(&job.id);
            }
        }
        pipe.query_async::<()>(&mut conn).await?;

        metrics::record_enqueued(job.class.as_str());
        debug!(
            job_id = %job.id,
            class = %job.class,
            priority = %job.priority,
            state = %job.state,
            "Enqueued job"
        );

        if job.state == JobState::Delayed {
            return Ok(None);
        }

        let rank: Option<u64> = redis::cmd("ZRANK")
            .arg(self.keys.waiting(job.class))
            .arg(&job.id)
            .query_async(&mut conn)
            .await?;
        Ok(rank.map(|r| r + 1))
    }

    /// Persist a batch of jobs in one pipeline. No positions are reported;
    /// producers that need them enqueue individually.
    pub async fn enqueue_batch(&self, jobs: &[Job]) -> EngineResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for job in jobs {
            let job_key = self.keys.job(job.class, &job.id);
            let fields = job.to_hash_fields()?;
            {
                let cmd = pipe.cmd("HSET").arg(&job_key);
                for (field, value) in &fields {
                    cmd.arg(*field).arg(value);
                }
            }
            match job.state {
                JobState::Delayed => {
                    pipe.cmd("ZADD")
                        .arg(self.keys.delayed(job.class))
                        .arg(job.delay_until)
                        .arg(&job.id);
                }
                _ => {
                    pipe.cmd("ZADD")
                        .arg(self.keys.waiting(job.class))
                        .arg(job.waiting_score())
                        .arg(&job.id);
                }
            }
        }
        pipe.query_async::<()>(&mut conn).await?;

        for job in jobs {
            metrics::record_enqueued(job.class.as_str());
        }
        debug!(count = jobs.len(), "Enqueued job batch");
        Ok(())
    }

    /// CAS-acquire one specific waiting job (polling-loop path).
    ///
    /// `Ok(Some(job))` means this caller owns the job and must report its
    /// terminal state. `Ok(None)` means the CAS was lost (the dispatcher got
    /// there first) or the record had vanished; skip the job either way.
    pub async fn acquire(
        &self,
        class: JobClass,
        id: &str,
        worker_id: &str,
    ) -> EngineResult<Option<Job>> {
        let mut conn = self.connection();
        let now = Self::now_ms();
        let outcome: i64 = self
            .acquire_script
            .key(self.keys.waiting(class))
            .key(self.keys.active(class))
            .key(self.keys.job(class, id))
            .arg(id)
            .arg(now)
            .arg(now + self.lease_ms as i64)
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => self.load_job(class, id).await,
            -1 => {
                warn!(job_id = %id, class = %class, "Acquired id had no record; dropped");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Pop up to `count` eligible jobs for a class (dispatcher path).
    /// Popped ids whose record fails to decode are removed and counted.
    pub async fn pop_waiting(
        &self,
        class: JobClass,
        count: usize,
        worker_id: &str,
    ) -> EngineResult<Vec<Job>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection();
        let now = Self::now_ms();
        let ids: Vec<String> = self
            .pop_script
            .key(self.keys.waiting(class))
            .key(self.keys.active(class))
            .arg(count)
            .arg(now)
            .arg(now + self.lease_ms as i64)
            .arg(self.keys.job_prefix(class))
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_job(class, &id).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %id, class = %class, error = %e, "Popped job failed to decode; removing");
                    self.remove(class, &id).await?;
                    self.error_window.record(true);
                    metrics::record_failed(class.as_str(), ErrorCategory::Permanent.as_str());
                }
            }
        }
        Ok(jobs)
    }

    /// Promote a due delayed job to `waiting`. Idempotent: promoting a job
    /// that is no longer delayed is a no-op.
    pub async fn promote(&self, class: JobClass, id: &str) -> EngineResult<bool> {
        let mut conn = self.connection();
        let outcome: i64 = self
            .promote_script
            .key(self.keys.delayed(class))
            .key(self.keys.waiting(class))
            .key(self.keys.job(class, id))
            .arg(id)
            .arg(Self::now_ms())
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => {
                debug!(job_id = %id, class = %class, "Promoted delayed job");
                Ok(true)
            }
            -1 => {
                debug!(job_id = %id, class = %class, "Promotion skipped; not yet due");
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Terminal success. Idempotent: the second call is a no-op and never
    /// duplicates retention entries.
    pub async fn mark_completed(
        &self,
        job: &Job,
        result: &serde_json::Value,
    ) -> EngineResult<bool> {
        let mut conn = self.connection();
        let outcome: i64 = self
            .complete_script
            .key(self.keys.active(job.class))
            .key(self.keys.completed(job.class))
            .key(self.keys.job(job.class, &job.id))
            .key(self.keys.last_processed())
            .arg(&job.id)
            .arg(Self::now_ms())
            .arg(job.remove_on_complete)
            .arg(self.keys.job_prefix(job.class))
            .arg(serde_json::to_string(result)?)
            .invoke_async(&mut conn)
            .await?;

        if outcome == 0 {
            return Ok(false);
        }

        self.error_window.record(false);
        metrics::record_completed(job.class.as_str());
        debug!(job_id = %job.id, class = %job.class, "Job completed");

        let observers = self.observers.read().unwrap().clone();
        for observer in observers {
            observer.on_completed(job, result);
        }
        Ok(true)
    }

    /// Report a failed attempt. With `retry` and attempts remaining, the job
    /// is rescheduled with exponential backoff; otherwise it goes terminal.
    pub async fn mark_failed(
        &self,
        job: &Job,
        error: &str,
        category: ErrorCategory,
        retry: bool,
    ) -> EngineResult<FailureOutcome> {
        let mut conn = self.connection();
        let will_retry = retry && category.should_retry() && job.can_retry();

        let outcome = if will_retry {
            let delay_ms = job.backoff.next_delay_ms(job.attempts_made.max(1));
            let delay_until = Self::now_ms() + delay_ms as i64;
            let changed: i64 = self
                .retry_script
                .key(self.keys.active(job.class))
                .key(self.keys.delayed(job.class))
                .key(self.keys.job(job.class, &job.id))
                .arg(&job.id)
                .arg(delay_until)
                .arg(error)
                .invoke_async(&mut conn)
                .await?;
            if changed == 0 {
                return Ok(FailureOutcome::NoOp);
            }
            debug!(
                job_id = %job.id,
                class = %job.class,
                attempt = job.attempts_made,
                delay_ms,
                "Scheduled retry with backoff"
            );
            FailureOutcome::Retried { delay_ms }
        } else {
            let changed: i64 = self
                .fail_script
                .key(self.keys.active(job.class))
                .key(self.keys.failed(job.class))
                .key(self.keys.job(job.class, &job.id))
                .key(self.keys.last_processed())
                .arg(&job.id)
                .arg(Self::now_ms())
                .arg(job.remove_on_fail)
                .arg(self.keys.job_prefix(job.class))
                .arg(error)
                .invoke_async(&mut conn)
                .await?;
            if changed == 0 {
                return Ok(FailureOutcome::NoOp);
            }
            warn!(
                job_id = %job.id,
                class = %job.class,
                attempts = job.attempts_made,
                error,
                "Job failed terminally"
            );
            FailureOutcome::Terminal
        };

        self.error_window.record(true);
        metrics::record_failed(job.class.as_str(), category.as_str());

        let terminal = outcome == FailureOutcome::Terminal;
        let observers = self.observers.read().unwrap().clone();
        for observer in observers {
            observer.on_failed(job, error, terminal);
        }
        Ok(outcome)
    }

    /// Unconditional deletion: record and any set membership.
    pub async fn remove(&self, class: JobClass, id: &str) -> EngineResult<()> {
        let mut conn = self.connection();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(self.keys.job(class, id));
        for state in [
            JobState::Waiting,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            pipe.cmd("ZREM").arg(self.keys.state_set(class, state)).arg(id);
        }
        pipe.query_async::<()>(&mut conn).await?;
        debug!(job_id = %id, class = %class, "Removed job");
        Ok(())
    }

    /// Bulk purge of terminal jobs older than `older_than_ms`, up to `limit`
    /// per class. Only `completed` and `failed` may be cleaned.
    pub async fn clean(
        &self,
        older_than_ms: u64,
        limit: u64,
        state: JobState,
    ) -> EngineResult<u64> {
        if !matches!(state, JobState::Completed | JobState::Failed) {
            return Err(EngineError::Config(format!(
                "clean() only accepts terminal states, got '{}'",
                state
            )));
        }

        let cutoff = Self::now_ms() - older_than_ms as i64;
        let mut conn = self.connection();
        let mut purged = 0u64;
        for class in JobClass::ALL {
            let count: i64 = self
                .clean_script
                .key(self.keys.state_set(class, state))
                .arg(cutoff)
                .arg(limit)
                .arg(self.keys.job_prefix(class))
                .invoke_async(&mut conn)
                .await?;
            purged += count as u64;
        }
        if purged > 0 {
            debug!(purged, state = %state, "Cleaned terminal jobs");
        }
        Ok(purged)
    }

    /// Return lease-expired active jobs to `waiting`. Returns the count.
    pub async fn requeue_expired(&self, class: JobClass, limit: u64) -> EngineResult<u64> {
        let mut conn = self.connection();
        let count: i64 = self
            .reclaim_script
            .key(self.keys.active(class))
            .key(self.keys.waiting(class))
            .arg(Self::now_ms())
            .arg(self.keys.job_prefix(class))
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        if count > 0 {
            warn!(class = %class, count, "Requeued lease-expired active jobs");
        }
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Load one job record. `Ok(None)` when no record exists.
    pub async fn load_job(&self, class: JobClass, id: &str) -> EngineResult<Option<Job>> {
        let mut conn = self.connection();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(class, id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Job::from_hash(&map).map(Some)
    }

    /// Ids at the head of a state set (non-destructive).
    pub async fn state_ids(
        &self,
        class: JobClass,
        state: JobState,
        count: usize,
    ) -> EngineResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.keys.state_set(class, state))
            .arg(0)
            .arg(count as i64 - 1)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn fetch_state(
        &self,
        class: JobClass,
        state: JobState,
        count: usize,
    ) -> EngineResult<Vec<Job>> {
        let ids = self.state_ids(class, state, count).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_job(class, &id).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %id, class = %class, error = %e, "Skipping undecodable job during fetch");
                }
            }
        }
        Ok(jobs)
    }

    /// Non-destructive inspection of the waiting set head.
    pub async fn fetch_waiting(&self, class: JobClass, count: usize) -> EngineResult<Vec<Job>> {
        self.fetch_state(class, JobState::Waiting, count).await
    }

    /// Non-destructive inspection of the delayed set (soonest due first).
    pub async fn fetch_delayed(&self, class: JobClass, count: usize) -> EngineResult<Vec<Job>> {
        self.fetch_state(class, JobState::Delayed, count).await
    }

    /// Non-destructive inspection of active jobs (oldest lease first).
    pub async fn fetch_active(&self, class: JobClass, count: usize) -> EngineResult<Vec<Job>> {
        self.fetch_state(class, JobState::Active, count).await
    }

    /// Per-state counts for one class.
    pub async fn counts(&self, class: JobClass) -> EngineResult<StateCounts> {
        let mut conn = self.connection();
        let mut pipe = redis::pipe();
        for state in JobState::ALL {
            pipe.cmd("ZCARD").arg(self.keys.state_set(class, state));
        }
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            pipe.query_async(&mut conn).await?;
        Ok(StateCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    /// Total jobs currently in terminal `failed` (the logical DLQ).
    pub async fn dlq_count(&self) -> EngineResult<u64> {
        let mut total = 0;
        for class in JobClass::ALL {
            total += self.counts(class).await?.failed;
        }
        Ok(total)
    }

    /// Trailing-window error rate (percent).
    pub fn error_rate_percent(&self) -> f64 {
        self.error_window.rate_percent()
    }

    /// Epoch millis of the most recent terminal transition, if any.
    pub async fn last_processed_at(&self) -> EngineResult<Option<i64>> {
        let mut conn = self.connection();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.last_processed())
            .query_async(&mut conn)
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    /// Aggregate snapshot; recomputed on every call and pushed to the depth
    /// gauges as a side effect.
    pub async fn stats(&self) -> EngineResult<QueueStatsSnapshot> {
        let mut per_class = Vec::with_capacity(JobClass::ALL.len());
        let mut totals = StateCounts::default();
        let mut budget = 0usize;

        for class in JobClass::ALL {
            let counts = self.counts(class).await?;
            totals.add(&counts);
            budget += class.concurrency();

            metrics::set_queue_depth(class.as_str(), "waiting", counts.waiting as f64);
            metrics::set_queue_depth(class.as_str(), "delayed", counts.delayed as f64);
            metrics::set_queue_depth(class.as_str(), "active", counts.active as f64);
            per_class.push((class, counts));
        }

        let error_rate = self.error_rate_percent();
        metrics::set_error_rate(error_rate);
        metrics::set_dlq_count(totals.failed as f64);

        Ok(QueueStatsSnapshot {
            per_class,
            totals,
            error_rate_percent: error_rate,
            last_processed_at: self.last_processed_at().await?,
            worker_utilization: if budget == 0 {
                0.0
            } else {
                totals.active as f64 / budget as f64
            },
        })
    }

    /// Notify observers that the health monitor flagged stalled jobs.
    pub fn notify_stalled(&self, job_ids: &[String]) {
        let observers = self.observers.read().unwrap().clone();
        for observer in observers {
            observer.on_stalled(job_ids);
        }
    }

    /// Record an engine-level failure (e.g. a job removed by the polling
    /// loop) in the trailing error window.
    pub fn record_window_failure(&self) {
        self.error_window.record(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::waiting_score;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("relay");
        assert_eq!(
            keys.waiting(JobClass::WebhookInbound),
            "relay:webhook-inbound:waiting"
        );
        assert_eq!(
            keys.delayed(JobClass::AiResponse),
            "relay:ai-response:delayed"
        );
        assert_eq!(
            keys.job(JobClass::Cleanup, "abc"),
            "relay:cleanup:job:abc"
        );
        assert_eq!(
            keys.job_prefix(JobClass::ChatRelayProcessing),
            "relay:chat-relay-processing:job:"
        );
        assert_eq!(keys.last_processed(), "relay:last-processed");
    }

    #[test]
    fn test_error_window_rates() {
        let window = ErrorWindow::new(100);
        assert_eq!(window.rate_percent(), 0.0);

        window.record(false);
        window.record(false);
        window.record(false);
        window.record(true);
        assert_eq!(window.rate_percent(), 25.0);
    }

    #[test]
    fn test_error_window_resets_at_capacity() {
        let window = ErrorWindow::new(4);
        window.record(true);
        window.record(true);
        window.record(true);
        // Fourth sample reaches capacity and resets the window
        window.record(true);
        assert_eq!(window.rate_percent(), 0.0);
    }

    #[test]
    fn test_state_counts_accumulate() {
        let mut totals = StateCounts::default();
        totals.add(&StateCounts {
            waiting: 1,
            delayed: 2,
            active: 3,
            completed: 4,
            failed: 5,
        });
        totals.add(&StateCounts {
            waiting: 10,
            ..Default::default()
        });
        assert_eq!(totals.waiting, 11);
        assert_eq!(totals.failed, 5);
    }

    #[test]
    fn test_waiting_score_matches_script_constant() {
        // The promote/reclaim scripts rebuild the waiting score as
        // pri * 1e13 + enqueued_at; keep the Rust constant in lockstep.
        let score = waiting_score(crate::job::JobPriority::High, 1_700_000_000_000);
        assert_eq!(score, 2.0 * 1e13 + 1_700_000_000_000.0);
    }
}
