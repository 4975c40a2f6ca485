//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use queue_engine::{
    AiResponsePayload, ChatRelayPayload, EngineResult, HandlerContext, HandlerError, JobHandler,
    JobPayload, NotificationPayload, SessionKind, TenantSession, TenantSessionProvider,
};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Session that records its release so leak checks are possible.
pub struct RecordingSession {
    tenant: Option<String>,
    kind: SessionKind,
    released: Arc<AtomicU32>,
}

#[async_trait]
impl TenantSession for RecordingSession {
    fn tenant_id(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    fn kind(&self) -> SessionKind {
        self.kind
    }

    async fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Provider that counts acquisitions/releases and records the kinds used.
#[derive(Default)]
pub struct RecordingProvider {
    pub acquired: Arc<AtomicU32>,
    pub released: Arc<AtomicU32>,
    pub sessions: Arc<Mutex<Vec<(SessionKind, Option<String>)>>>,
}

impl RecordingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TenantSessionProvider for RecordingProvider {
    async fn acquire(
        &self,
        kind: SessionKind,
        tenant_id: Option<&str>,
    ) -> EngineResult<Box<dyn TenantSession>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .unwrap()
            .push((kind, tenant_id.map(str::to_string)));
        Ok(Box::new(RecordingSession {
            tenant: tenant_id.map(str::to_string),
            kind,
            released: Arc::clone(&self.released),
        }))
    }
}

/// What a [`CountingHandler`] does on each invocation.
pub enum Behavior {
    /// Return this value.
    Ok(serde_json::Value),
    /// Fail retryably this many times, then succeed.
    FailRetryableTimes(u32),
    /// Always fail retryably.
    AlwaysRetryable,
    /// Always fail permanently.
    AlwaysPermanent,
    /// Sleep, then succeed. Observes cancellation but finishes its work.
    SleepMsThenOk(u64),
}

/// Handler that counts invocations and records their timestamps.
pub struct CountingHandler {
    pub calls: Arc<AtomicU32>,
    pub call_times: Arc<Mutex<Vec<Instant>>>,
    behavior: Behavior,
}

impl CountingHandler {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(AtomicU32::new(0)),
            call_times: Arc::new(Mutex::new(Vec::new())),
            behavior,
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        _session: &mut dyn TenantSession,
        _job: &queue_engine::Job,
    ) -> Result<serde_json::Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_times.lock().unwrap().push(Instant::now());

        match &self.behavior {
            Behavior::Ok(value) => Ok(value.clone()),
            Behavior::FailRetryableTimes(n) => {
                if call <= *n {
                    Err(HandlerError::retryable(format!(
                        "transient failure on attempt {}",
                        call
                    )))
                } else {
                    Ok(serde_json::json!({ "attempt": call }))
                }
            }
            Behavior::AlwaysRetryable => {
                Err(HandlerError::retryable("downstream 503"))
            }
            Behavior::AlwaysPermanent => Err(HandlerError::permanent("validation rejected")),
            Behavior::SleepMsThenOk(ms) => {
                let cancelled = ctx.is_cancelled();
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(serde_json::json!({ "slept_ms": ms, "saw_cancellation": cancelled }))
            }
        }
    }

    fn name(&self) -> &'static str {
        "counting-handler"
    }
}

pub fn chat_relay_payload(event_id: &str, text: &str) -> JobPayload {
    JobPayload::ChatRelay(ChatRelayPayload {
        event_id: event_id.to_string(),
        username: "customer".to_string(),
        conversation_id: "conv-1".to_string(),
        incoming_message_id: "msg-1".to_string(),
        message_text: text.to_string(),
        image_refs: Vec::new(),
        session_data: serde_json::json!({}),
    })
}

pub fn ai_response_payload(conversation_id: &str) -> JobPayload {
    JobPayload::AiResponse(AiResponsePayload {
        conversation_id: conversation_id.to_string(),
        customer_id: "cust-1".to_string(),
        message: "what are your hours?".to_string(),
        platform: "instagram".to_string(),
    })
}

pub fn notification_payload(topic: &str) -> JobPayload {
    JobPayload::Notification(NotificationPayload {
        topic: topic.to_string(),
        body: "engine test".to_string(),
    })
}

/// Poll `check` until it returns true or the timeout expires.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
