//! Queue Core integration tests against a real Redis container.

mod common;

use common::{chat_relay_payload, notification_payload};
use chrono::Utc;
use queue_engine::{
    DlqManager, EnqueueOptions, ErrorCategory, FailureOutcome, Job, JobClass, JobPriority,
    JobState, QueueCore,
};
use std::sync::Arc;
use test_utils::TestRedis;

fn chat_job(event_id: &str) -> Job {
    Job::new(
        chat_relay_payload(event_id, "hello"),
        Some("M1".to_string()),
        EnqueueOptions::default(),
    )
    .unwrap()
}

fn notification_job(topic: &str, options: EnqueueOptions) -> Job {
    Job::new(notification_payload(topic), None, options).unwrap()
}

#[tokio::test]
async fn test_enqueue_lands_in_waiting_with_position() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = chat_job("evt-1");
    let position = queue.enqueue(&job).await.unwrap();
    assert_eq!(position, Some(1));

    let waiting = queue
        .fetch_waiting(JobClass::ChatRelayProcessing, 10)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, job.id);
    assert_eq!(waiting[0].state, JobState::Waiting);
    assert_eq!(waiting[0].attempts_made, 0);

    let second = chat_job("evt-2");
    let position = queue.enqueue(&second).await.unwrap();
    assert_eq!(position, Some(2));
}

#[tokio::test]
async fn test_enqueue_with_delay_lands_in_delayed() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = Job::new(
        chat_relay_payload("evt-1", "later"),
        Some("M1".to_string()),
        EnqueueOptions {
            delay_ms: Some(60_000),
            ..Default::default()
        },
    )
    .unwrap();

    let position = queue.enqueue(&job).await.unwrap();
    assert_eq!(position, None);

    let delayed = queue
        .fetch_delayed(JobClass::ChatRelayProcessing, 10)
        .await
        .unwrap();
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].state, JobState::Delayed);
    assert!(delayed[0].delay_until > Utc::now().timestamp_millis());
}

#[tokio::test]
async fn test_priority_orders_dispatch() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let normal = chat_job("evt-normal");
    queue.enqueue(&normal).await.unwrap();

    let urgent = Job::new(
        chat_relay_payload("evt-urgent", "now!"),
        Some("M1".to_string()),
        EnqueueOptions {
            priority: Some(JobPriority::Urgent),
            ..Default::default()
        },
    )
    .unwrap();
    queue.enqueue(&urgent).await.unwrap();

    // Urgent dispatches first despite enqueueing second.
    let popped = queue
        .pop_waiting(JobClass::ChatRelayProcessing, 1, "w1")
        .await
        .unwrap();
    assert_eq!(popped.len(), 1);
    assert_eq!(popped[0].id, urgent.id);

    let popped = queue
        .pop_waiting(JobClass::ChatRelayProcessing, 1, "w1")
        .await
        .unwrap();
    assert_eq!(popped[0].id, normal.id);
}

#[tokio::test]
async fn test_pop_stamps_active_state_and_attempts() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = chat_job("evt-1");
    queue.enqueue(&job).await.unwrap();

    let popped = queue
        .pop_waiting(JobClass::ChatRelayProcessing, 5, "w1")
        .await
        .unwrap();
    assert_eq!(popped.len(), 1);
    assert_eq!(popped[0].state, JobState::Active);
    assert_eq!(popped[0].attempts_made, 1);
    assert!(popped[0].dispatched_at.is_some());
    assert_eq!(popped[0].worker_id.as_deref(), Some("w1"));

    let counts = queue.counts(JobClass::ChatRelayProcessing).await.unwrap();
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.active, 1);
}

#[tokio::test]
async fn test_acquire_cas_single_winner() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = chat_job("evt-1");
    queue.enqueue(&job).await.unwrap();

    let first = queue
        .acquire(JobClass::ChatRelayProcessing, &job.id, "w1")
        .await
        .unwrap();
    assert!(first.is_some());

    // Second caller loses the CAS and must skip.
    let second = queue
        .acquire(JobClass::ChatRelayProcessing, &job.id, "w2")
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn test_promote_due_job_is_idempotent() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let mut job = Job::new(
        chat_relay_payload("evt-1", "overdue"),
        Some("M1".to_string()),
        EnqueueOptions {
            delay_ms: Some(60_000),
            ..Default::default()
        },
    )
    .unwrap();
    job.delay_until = Utc::now().timestamp_millis() - 1_000;
    queue.enqueue(&job).await.unwrap();

    assert!(queue
        .promote(JobClass::ChatRelayProcessing, &job.id)
        .await
        .unwrap());

    // Promoting again is a no-op, not an error.
    assert!(!queue
        .promote(JobClass::ChatRelayProcessing, &job.id)
        .await
        .unwrap());

    let promoted = queue
        .load_job(JobClass::ChatRelayProcessing, &job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(promoted.state, JobState::Waiting);
    assert_eq!(promoted.delay_until, 0);
}

#[tokio::test]
async fn test_promote_before_deadline_is_refused() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = Job::new(
        chat_relay_payload("evt-1", "later"),
        Some("M1".to_string()),
        EnqueueOptions {
            delay_ms: Some(60_000),
            ..Default::default()
        },
    )
    .unwrap();
    queue.enqueue(&job).await.unwrap();

    assert!(!queue
        .promote(JobClass::ChatRelayProcessing, &job.id)
        .await
        .unwrap());

    let counts = queue.counts(JobClass::ChatRelayProcessing).await.unwrap();
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn test_mark_completed_is_idempotent() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = chat_job("evt-1");
    queue.enqueue(&job).await.unwrap();
    let active = queue
        .pop_waiting(JobClass::ChatRelayProcessing, 1, "w1")
        .await
        .unwrap()
        .remove(0);

    let result = serde_json::json!({ "ok": true });
    assert!(queue.mark_completed(&active, &result).await.unwrap());

    // Second call is a no-op and never duplicates retention entries.
    assert!(!queue.mark_completed(&active, &result).await.unwrap());

    let counts = queue.counts(JobClass::ChatRelayProcessing).await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.active, 0);

    assert!(queue.last_processed_at().await.unwrap().is_some());
}

#[tokio::test]
async fn test_retention_evicts_oldest_completed() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let mut first_id = None;
    for i in 0..3 {
        let job = Job::new(
            chat_relay_payload(&format!("evt-{}", i), "hi"),
            Some("M1".to_string()),
            EnqueueOptions {
                retention_on_complete: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        if i == 0 {
            first_id = Some(job.id.clone());
        }
        queue.enqueue(&job).await.unwrap();
        let active = queue
            .pop_waiting(JobClass::ChatRelayProcessing, 1, "w1")
            .await
            .unwrap()
            .remove(0);
        queue
            .mark_completed(&active, &serde_json::json!({}))
            .await
            .unwrap();
    }

    let counts = queue.counts(JobClass::ChatRelayProcessing).await.unwrap();
    assert_eq!(counts.completed, 2);

    // The oldest record was evicted entirely.
    let evicted = queue
        .load_job(JobClass::ChatRelayProcessing, &first_id.unwrap())
        .await
        .unwrap();
    assert!(evicted.is_none());
}

#[tokio::test]
async fn test_mark_failed_retries_with_backoff() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = Job::new(
        notification_payload("retry-me"),
        None,
        EnqueueOptions {
            max_attempts: Some(3),
            backoff: Some(queue_engine::BackoffPolicy::Exponential { base_delay_ms: 100 }),
            ..Default::default()
        },
    )
    .unwrap();
    queue.enqueue(&job).await.unwrap();
    let active = queue
        .pop_waiting(JobClass::Notification, 1, "w1")
        .await
        .unwrap()
        .remove(0);

    let before = Utc::now().timestamp_millis();
    let outcome = queue
        .mark_failed(&active, "downstream 503", ErrorCategory::Transient, true)
        .await
        .unwrap();

    let FailureOutcome::Retried { delay_ms } = outcome else {
        panic!("expected retry, got {:?}", outcome);
    };
    // base * 2^(1-1) = 100ms, jittered by at most ±10%
    assert!((90..=110).contains(&delay_ms), "delay {}", delay_ms);

    let delayed = queue
        .load_job(JobClass::Notification, &active.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delayed.state, JobState::Delayed);
    assert_eq!(delayed.last_error.as_deref(), Some("downstream 503"));
    assert!(delayed.delay_until >= before + 90);
    assert!(delayed.delay_until <= Utc::now().timestamp_millis() + 110);
}

#[tokio::test]
async fn test_mark_failed_retry_cannot_resurrect_settled_job() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = chat_job("evt-1");
    queue.enqueue(&job).await.unwrap();
    let active = queue
        .pop_waiting(JobClass::ChatRelayProcessing, 1, "w1")
        .await
        .unwrap()
        .remove(0);

    queue
        .mark_completed(&active, &serde_json::json!({}))
        .await
        .unwrap();

    // A racing worker reports a failure for the same attempt after the job
    // settled: the report is a no-op, not a transition back to delayed.
    let outcome = queue
        .mark_failed(&active, "late duplicate report", ErrorCategory::Transient, true)
        .await
        .unwrap();
    assert_eq!(outcome, FailureOutcome::NoOp);

    let settled = queue
        .load_job(JobClass::ChatRelayProcessing, &active.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.state, JobState::Completed);

    let counts = queue.counts(JobClass::ChatRelayProcessing).await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.delayed, 0);
}

#[tokio::test]
async fn test_mark_failed_exhausted_attempts_is_terminal() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = notification_job(
        "fail-me",
        EnqueueOptions {
            max_attempts: Some(1),
            ..Default::default()
        },
    );
    queue.enqueue(&job).await.unwrap();
    let active = queue
        .pop_waiting(JobClass::Notification, 1, "w1")
        .await
        .unwrap()
        .remove(0);
    assert!(!active.can_retry());

    let outcome = queue
        .mark_failed(&active, "downstream 503", ErrorCategory::Transient, true)
        .await
        .unwrap();
    assert_eq!(outcome, FailureOutcome::Terminal);

    let counts = queue.counts(JobClass::Notification).await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.active, 0);
    assert_eq!(queue.dlq_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_mark_failed_permanent_skips_retry_budget() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = notification_job("poison", EnqueueOptions::default());
    queue.enqueue(&job).await.unwrap();
    let active = queue
        .pop_waiting(JobClass::Notification, 1, "w1")
        .await
        .unwrap()
        .remove(0);
    assert!(active.can_retry());

    let outcome = queue
        .mark_failed(&active, "validation rejected", ErrorCategory::Permanent, true)
        .await
        .unwrap();
    assert_eq!(outcome, FailureOutcome::Terminal);
}

#[tokio::test]
async fn test_remove_deletes_everywhere() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = chat_job("evt-1");
    queue.enqueue(&job).await.unwrap();

    queue
        .remove(JobClass::ChatRelayProcessing, &job.id)
        .await
        .unwrap();

    let counts = queue.counts(JobClass::ChatRelayProcessing).await.unwrap();
    assert_eq!(counts.waiting, 0);
    assert!(queue
        .load_job(JobClass::ChatRelayProcessing, &job.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_clean_purges_old_terminal_jobs() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = chat_job("evt-1");
    queue.enqueue(&job).await.unwrap();
    let active = queue
        .pop_waiting(JobClass::ChatRelayProcessing, 1, "w1")
        .await
        .unwrap()
        .remove(0);
    queue
        .mark_completed(&active, &serde_json::json!({}))
        .await
        .unwrap();

    // Threshold zero: everything already completed is "old".
    let purged = queue.clean(0, 100, JobState::Completed).await.unwrap();
    assert_eq!(purged, 1);

    let counts = queue.counts(JobClass::ChatRelayProcessing).await.unwrap();
    assert_eq!(counts.completed, 0);
}

#[tokio::test]
async fn test_clean_rejects_non_terminal_states() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let err = queue.clean(0, 100, JobState::Waiting).await.unwrap_err();
    assert!(err.to_string().contains("terminal"));
}

#[tokio::test]
async fn test_requeue_expired_lease_returns_job_to_waiting() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest").with_lease_ms(1_000);

    let job = chat_job("evt-1");
    queue.enqueue(&job).await.unwrap();
    queue
        .pop_waiting(JobClass::ChatRelayProcessing, 1, "crashed-worker")
        .await
        .unwrap();

    // Lease still valid: nothing to reclaim.
    assert_eq!(
        queue
            .requeue_expired(JobClass::ChatRelayProcessing, 10)
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;

    assert_eq!(
        queue
            .requeue_expired(JobClass::ChatRelayProcessing, 10)
            .await
            .unwrap(),
        1
    );

    let reclaimed = queue
        .load_job(JobClass::ChatRelayProcessing, &job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.state, JobState::Waiting);
    assert!(reclaimed.worker_id.is_none());
    // The spent attempt is retained.
    assert_eq!(reclaimed.attempts_made, 1);
}

#[tokio::test]
async fn test_stats_aggregates_all_classes() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    queue.enqueue(&chat_job("evt-1")).await.unwrap();
    queue
        .enqueue(&notification_job("n-1", EnqueueOptions::default()))
        .await
        .unwrap();
    let delayed = Job::new(
        notification_payload("n-2"),
        None,
        EnqueueOptions {
            delay_ms: Some(60_000),
            ..Default::default()
        },
    )
    .unwrap();
    queue.enqueue(&delayed).await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.totals.waiting, 2);
    assert_eq!(stats.totals.delayed, 1);
    assert_eq!(stats.totals.active, 0);
    assert_eq!(stats.per_class.len(), JobClass::ALL.len());
    assert_eq!(stats.worker_utilization, 0.0);
    assert!(stats.last_processed_at.is_none());
}

#[tokio::test]
async fn test_batch_enqueue() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let jobs: Vec<Job> = (0..5)
        .map(|i| chat_job(&format!("evt-{}", i)))
        .collect();
    queue.enqueue_batch(&jobs).await.unwrap();

    let counts = queue.counts(JobClass::ChatRelayProcessing).await.unwrap();
    assert_eq!(counts.waiting, 5);
}

#[tokio::test]
async fn test_dlq_list_requeue_and_purge() {
    let redis = TestRedis::new().await;
    let queue = Arc::new(QueueCore::new(redis.connection(), "qtest"));
    let dlq = DlqManager::new(redis.connection(), Arc::clone(&queue));

    // Land two jobs in the DLQ.
    for topic in ["boom-1", "boom-2"] {
        let job = notification_job(
            topic,
            EnqueueOptions {
                max_attempts: Some(1),
                ..Default::default()
            },
        );
        queue.enqueue(&job).await.unwrap();
        let active = queue
            .pop_waiting(JobClass::Notification, 1, "w1")
            .await
            .unwrap()
            .remove(0);
        queue
            .mark_failed(&active, "exploded", ErrorCategory::Transient, true)
            .await
            .unwrap();
    }

    let stats = dlq.stats().await.unwrap();
    assert_eq!(stats.total, 2);

    let entries = dlq.list(JobClass::Notification, 10, 0).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].last_error.as_deref(), Some("exploded"));

    // Requeue the oldest: back to waiting with a fresh attempt budget.
    let requeued_id = entries[0].job_id.clone();
    assert!(dlq.requeue(JobClass::Notification, &requeued_id).await.unwrap());

    let requeued = queue
        .load_job(JobClass::Notification, &requeued_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(requeued.state, JobState::Waiting);
    assert_eq!(requeued.attempts_made, 0);
    assert!(requeued.last_error.is_none());

    // Requeueing a job that is no longer failed reports false.
    assert!(!dlq.requeue(JobClass::Notification, &requeued_id).await.unwrap());

    // Purge the rest.
    let purged = dlq.purge_all(JobClass::Notification).await.unwrap();
    assert_eq!(purged, 1);
    assert_eq!(dlq.stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_legacy_priority_record_still_dispatches() {
    let redis = TestRedis::new().await;
    let queue = QueueCore::new(redis.connection(), "qtest");

    let job = chat_job("evt-legacy");
    queue.enqueue(&job).await.unwrap();

    // Simulate a record persisted by an older deployment.
    let mut conn = redis.connection();
    let _: () = redis::cmd("HSET")
        .arg(format!("qtest:chat-relay-processing:job:{}", job.id))
        .arg("priority")
        .arg("CRITICAL")
        .query_async(&mut conn)
        .await
        .unwrap();

    let loaded = queue
        .load_job(JobClass::ChatRelayProcessing, &job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.priority, JobPriority::Urgent);
}
