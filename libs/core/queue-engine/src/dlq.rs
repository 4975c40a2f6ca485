//! Dead letter queue administration.
//!
//! The DLQ is the logical set of jobs in terminal `failed` state, retained
//! per class for post-mortem. This manager gives operators stats, listing,
//! requeue (one or batch), and purge over those sets; it is surfaced through
//! the admin HTTP endpoints.

use crate::error::EngineResult;
use crate::job::{Job, JobClass};
use crate::queue::{QueueCore, QueueKeys};
use redis::aio::ConnectionManager;
use redis::Script;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Requeue a failed job: `failed → waiting` with the attempt budget reset.
/// KEYS: failed, waiting, job. ARGV: id, now_ms.
/// Returns 1 = requeued, 0 = not in failed, -1 = record missing.
const REQUEUE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
if redis.call('EXISTS', KEYS[3]) == 0 then return -1 end
local pri = tonumber(redis.call('HGET', KEYS[3], 'priority') or '3')
redis.call('HSET', KEYS[3], 'state', 'waiting', 'attempts_made', '0', 'delay_until', '0')
redis.call('HDEL', KEYS[3], 'last_error', 'completed_at')
redis.call('ZADD', KEYS[2], pri * 1e13 + tonumber(ARGV[2]), ARGV[1])
return 1
"#;

/// One failed job as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct DlqEntry {
    pub job_id: String,
    pub class: JobClass,
    pub merchant_id: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    /// Epoch millis of the terminal transition.
    pub failed_at: Option<i64>,
}

impl DlqEntry {
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            class: job.class,
            merchant_id: job.merchant_id.clone(),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            last_error: job.last_error.clone(),
            failed_at: job.completed_at,
        }
    }
}

/// DLQ-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub per_class: Vec<(JobClass, u64)>,
    pub total: u64,
}

/// Operator tooling over the failed sets.
pub struct DlqManager {
    conn: ConnectionManager,
    keys: QueueKeys,
    queue: Arc<QueueCore>,
    requeue_script: Script,
}

impl DlqManager {
    pub fn new(conn: ConnectionManager, queue: Arc<QueueCore>) -> Self {
        Self {
            conn,
            keys: queue.keys().clone(),
            queue,
            requeue_script: Script::new(REQUEUE_SCRIPT),
        }
    }

    /// Per-class and total failed counts.
    pub async fn stats(&self) -> EngineResult<DlqStats> {
        let mut per_class = Vec::with_capacity(JobClass::ALL.len());
        let mut total = 0;
        for class in JobClass::ALL {
            let count = self.queue.counts(class).await?.failed;
            total += count;
            per_class.push((class, count));
        }
        Ok(DlqStats { per_class, total })
    }

    /// List failed jobs for a class, oldest first.
    pub async fn list(
        &self,
        class: JobClass,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<DlqEntry>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.keys.failed(class))
            .arg(offset as i64)
            .arg((offset + limit) as i64 - 1)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(class, &id).await {
                Ok(Some(job)) => entries.push(DlqEntry::from_job(&job)),
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %id, class = %class, error = %e, "Skipping undecodable DLQ entry");
                }
            }
        }
        Ok(entries)
    }

    /// Requeue one failed job with its attempt budget reset.
    /// Returns false when the job is not in the failed set.
    pub async fn requeue(&self, class: JobClass, id: &str) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .requeue_script
            .key(self.keys.failed(class))
            .key(self.keys.waiting(class))
            .key(self.keys.job(class, id))
            .arg(id)
            .arg(chrono::Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => {
                info!(job_id = %id, class = %class, "Requeued job from DLQ");
                Ok(true)
            }
            -1 => {
                warn!(job_id = %id, class = %class, "DLQ entry had no record; dropped");
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Requeue up to `count` failed jobs, oldest first. Returns how many
    /// were requeued.
    pub async fn requeue_batch(&self, class: JobClass, count: usize) -> EngineResult<u64> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.keys.failed(class))
            .arg(0)
            .arg(count as i64 - 1)
            .query_async(&mut conn)
            .await?;

        let mut requeued = 0;
        for id in ids {
            if self.requeue(class, &id).await? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Delete one failed job permanently.
    pub async fn purge(&self, class: JobClass, id: &str) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.keys.failed(class))
            .arg(id)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            return Ok(false);
        }
        let _: () = redis::cmd("DEL")
            .arg(self.keys.job(class, id))
            .query_async(&mut conn)
            .await?;
        info!(job_id = %id, class = %class, "Purged job from DLQ");
        Ok(true)
    }

    /// Delete every failed job for a class. Returns the purge count.
    pub async fn purge_all(&self, class: JobClass) -> EngineResult<u64> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.keys.failed(class))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut purged = 0;
        for id in &ids {
            let _: () = redis::cmd("DEL")
                .arg(self.keys.job(class, id))
                .query_async(&mut conn)
                .await?;
            purged += 1;
        }
        let _: () = redis::cmd("DEL")
            .arg(self.keys.failed(class))
            .query_async(&mut conn)
            .await?;

        if purged > 0 {
            warn!(class = %class, purged, "Purged all DLQ entries for class");
        }
        Ok(purged)
    }

    async fn load(&self, class: JobClass, id: &str) -> EngineResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(class, id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Job::from_hash(&map).map(Some)
    }
}
