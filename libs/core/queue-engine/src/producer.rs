//! Enqueue API consumed by the webhook ingress and the outbound-reply
//! producer.
//!
//! Inputs are plain values; the acknowledgment never surfaces Redis
//! internals. Before the engine is initialized (and again after shutdown)
//! every enqueue returns `ok: false` instead of erroring.

use crate::error::{EngineResult, ErrorCategory};
use crate::job::{
    AiResponsePayload, BackoffPolicy, ChatRelayPayload, EnqueueOptions, Job, JobPayload,
    JobPriority, WebhookEventPayload,
};
use crate::queue::QueueCore;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retries for a transient enqueue failure.
const ENQUEUE_RETRIES: u32 = 2;
const ENQUEUE_RETRY_DELAY_MS: u64 = 100;

/// Enqueue acknowledgment returned to callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnqueueAck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnqueueAck {
    fn accepted(job_id: String, position: Option<u64>) -> Self {
        Self {
            ok: true,
            job_id: Some(job_id),
            position,
            error: None,
        }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            job_id: None,
            position: None,
            error: Some(error.into()),
        }
    }
}

enum Binding {
    /// Initialization has not bound a queue yet.
    Unbound,
    Bound(Arc<QueueCore>),
    /// The engine has been shut down.
    Closed,
}

/// Producer handle. Cheap to clone; all clones share the binding, so the
/// supervisor closing the engine flips every outstanding handle at once.
#[derive(Clone)]
pub struct EnqueueProducer {
    binding: Arc<RwLock<Binding>>,
    default_backoff_base_ms: u64,
    default_max_attempts: Option<u32>,
}

impl EnqueueProducer {
    /// A producer with no queue bound yet.
    pub fn detached(default_backoff_base_ms: u64, default_max_attempts: Option<u32>) -> Self {
        Self {
            binding: Arc::new(RwLock::new(Binding::Unbound)),
            default_backoff_base_ms,
            default_max_attempts,
        }
    }

    /// Bind the queue at the end of initialization.
    pub fn bind(&self, queue: Arc<QueueCore>) {
        *self.binding.write().unwrap() = Binding::Bound(queue);
    }

    /// Detach permanently; subsequent enqueues report "not initialized".
    pub fn close(&self) {
        *self.binding.write().unwrap() = Binding::Closed;
    }

    pub fn is_bound(&self) -> bool {
        matches!(*self.binding.read().unwrap(), Binding::Bound(_))
    }

    /// Enqueue an inbound platform webhook event.
    pub async fn enqueue_webhook(
        &self,
        event_id: &str,
        event: serde_json::Value,
        merchant_id: &str,
        platform: &str,
        priority: Option<JobPriority>,
    ) -> EnqueueAck {
        self.enqueue(
            JobPayload::WebhookInbound(WebhookEventPayload {
                event_id: event_id.to_string(),
                platform: platform.to_string(),
                event,
            }),
            Some(merchant_id.to_string()),
            EnqueueOptions {
                priority,
                ..Default::default()
            },
        )
        .await
    }

    /// Enqueue generation of an AI reply for a conversation.
    pub async fn enqueue_ai_response(
        &self,
        conversation_id: &str,
        merchant_id: &str,
        customer_id: &str,
        message: &str,
        platform: &str,
        priority: Option<JobPriority>,
    ) -> EnqueueAck {
        self.enqueue(
            JobPayload::AiResponse(AiResponsePayload {
                conversation_id: conversation_id.to_string(),
                customer_id: customer_id.to_string(),
                message: message.to_string(),
                platform: platform.to_string(),
            }),
            Some(merchant_id.to_string()),
            EnqueueOptions {
                priority,
                ..Default::default()
            },
        )
        .await
    }

    /// Enqueue a ManyChat relay event.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_chat_relay(
        &self,
        event_id: &str,
        merchant_id: &str,
        username: &str,
        conversation_id: &str,
        incoming_message_id: &str,
        message_text: &str,
        image_refs: Vec<String>,
        session_data: serde_json::Value,
        priority: Option<JobPriority>,
    ) -> EnqueueAck {
        self.enqueue(
            JobPayload::ChatRelay(ChatRelayPayload {
                event_id: event_id.to_string(),
                username: username.to_string(),
                conversation_id: conversation_id.to_string(),
                incoming_message_id: incoming_message_id.to_string(),
                message_text: message_text.to_string(),
                image_refs,
                session_data,
            }),
            Some(merchant_id.to_string()),
            EnqueueOptions {
                priority,
                ..Default::default()
            },
        )
        .await
    }

    /// Enqueue any payload with explicit options.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        merchant_id: Option<String>,
        options: EnqueueOptions,
    ) -> EnqueueAck {
        let queue = match self.queue() {
            Ok(queue) => queue,
            Err(ack) => return ack,
        };

        let job = match self.build_job(payload, merchant_id, options) {
            Ok(job) => job,
            Err(ack) => return ack,
        };

        match self.enqueue_with_retry(&queue, &job).await {
            Ok(position) => {
                debug!(job_id = %job.id, class = %job.class, "Enqueue accepted");
                EnqueueAck::accepted(job.id.clone(), position)
            }
            Err(e) => {
                warn!(class = %job.class, error = %e, "Enqueue failed after retries");
                EnqueueAck::rejected("queue write failed")
            }
        }
    }

    /// Enqueue a batch in one pipeline. Positions are not reported.
    pub async fn enqueue_batch(
        &self,
        items: Vec<(JobPayload, Option<String>, EnqueueOptions)>,
    ) -> Vec<EnqueueAck> {
        let queue = match self.queue() {
            Ok(queue) => queue,
            Err(ack) => return items.iter().map(|_| ack.clone()).collect(),
        };

        let mut acks = Vec::with_capacity(items.len());
        let mut jobs = Vec::with_capacity(items.len());
        for (payload, merchant_id, options) in items {
            match self.build_job(payload, merchant_id, options) {
                Ok(job) => {
                    acks.push(EnqueueAck::accepted(job.id.clone(), None));
                    jobs.push(job);
                }
                Err(ack) => acks.push(ack),
            }
        }

        if let Err(e) = queue.enqueue_batch(&jobs).await {
            warn!(error = %e, count = jobs.len(), "Batch enqueue failed");
            let failed: std::collections::HashSet<&str> =
                jobs.iter().map(|j| j.id.as_str()).collect();
            for ack in acks.iter_mut() {
                if ack
                    .job_id
                    .as_deref()
                    .map(|id| failed.contains(id))
                    .unwrap_or(false)
                {
                    *ack = EnqueueAck::rejected("queue write failed");
                }
            }
        }
        acks
    }

    fn queue(&self) -> Result<Arc<QueueCore>, EnqueueAck> {
        match &*self.binding.read().unwrap() {
            Binding::Bound(queue) => Ok(Arc::clone(queue)),
            Binding::Unbound => Err(EnqueueAck::rejected("queue unavailable")),
            Binding::Closed => Err(EnqueueAck::rejected("not initialized")),
        }
    }

    fn build_job(
        &self,
        payload: JobPayload,
        merchant_id: Option<String>,
        mut options: EnqueueOptions,
    ) -> Result<Job, EnqueueAck> {
        if options.backoff.is_none() {
            options.backoff = Some(BackoffPolicy::Exponential {
                base_delay_ms: self.default_backoff_base_ms,
            });
        }
        if options.max_attempts.is_none() {
            options.max_attempts = self.default_max_attempts;
        }
        Job::new(payload, merchant_id, options).map_err(|e| EnqueueAck::rejected(e.to_string()))
    }

    async fn enqueue_with_retry(
        &self,
        queue: &QueueCore,
        job: &Job,
    ) -> EngineResult<Option<u64>> {
        let mut attempt = 0;
        loop {
            match queue.enqueue(job).await {
                Ok(position) => return Ok(position),
                Err(e) if e.category() == ErrorCategory::Transient && attempt < ENQUEUE_RETRIES => {
                    attempt += 1;
                    debug!(
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "Transient enqueue failure; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(ENQUEUE_RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer() -> EnqueueProducer {
        EnqueueProducer::detached(2_000, None)
    }

    #[tokio::test]
    async fn test_unbound_producer_reports_queue_unavailable() {
        let ack = producer()
            .enqueue_webhook("evt-1", serde_json::json!({}), "M1", "instagram", None)
            .await;
        assert!(!ack.ok);
        assert_eq!(ack.error.as_deref(), Some("queue unavailable"));
        assert!(ack.job_id.is_none());
    }

    #[tokio::test]
    async fn test_closed_producer_reports_not_initialized() {
        let producer = producer();
        producer.close();

        let ack = producer
            .enqueue_ai_response("conv-1", "M1", "cust-1", "hi", "whatsapp", None)
            .await;
        assert!(!ack.ok);
        assert_eq!(ack.error.as_deref(), Some("not initialized"));
    }

    #[tokio::test]
    async fn test_batch_on_unbound_rejects_everything() {
        let acks = producer()
            .enqueue_batch(vec![
                (
                    JobPayload::Notification(crate::job::NotificationPayload {
                        topic: "t".into(),
                        body: "b".into(),
                    }),
                    None,
                    EnqueueOptions::default(),
                ),
                (
                    JobPayload::Cleanup(crate::job::CleanupPayload {
                        target: "x".into(),
                        older_than_ms: None,
                    }),
                    None,
                    EnqueueOptions::default(),
                ),
            ])
            .await;
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|a| !a.ok));
    }

    #[test]
    fn test_ack_serialization_skips_empty_fields() {
        let ack = EnqueueAck::rejected("queue unavailable");
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"ok\":false"));
        assert!(!json.contains("job_id"));
        assert!(!json.contains("position"));
    }

    #[test]
    fn test_is_bound_lifecycle() {
        let producer = producer();
        assert!(!producer.is_bound());
        producer.close();
        assert!(!producer.is_bound());
    }
}
