//! Job model: classes, priorities, states, payloads, and the hash-field
//! record format persisted in Redis.
//!
//! The payload is a sum type over job classes — each class has a concrete
//! payload struct and handlers receive the decoded variant, never raw JSON.

use crate::error::{EngineError, EngineResult};
use crate::session::SessionKind;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Priority tiers; lower numeric value dispatches first within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    #[serde(rename = "urgent")]
    Urgent = 1,
    #[serde(rename = "high")]
    High = 2,
    #[serde(rename = "normal")]
    Normal = 3,
    #[serde(rename = "low")]
    Low = 4,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Parse a priority from its canonical name, its numeric value, or the
    /// legacy literal set (`LOW|MEDIUM|HIGH|CRITICAL`) still present in
    /// records persisted by earlier deployments. Legacy values are migrated
    /// on read and logged.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "1" => return Some(Self::Urgent),
            "2" => return Some(Self::High),
            "3" => return Some(Self::Normal),
            "4" => return Some(Self::Low),
            _ => {}
        }

        match raw.to_ascii_lowercase().as_str() {
            "urgent" => Some(Self::Urgent),
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            "critical" => {
                warn!(raw, "Migrating legacy priority literal to 'urgent'");
                Some(Self::Urgent)
            }
            "medium" => {
                warn!(raw, "Migrating legacy priority literal to 'normal'");
                Some(Self::Normal)
            }
            _ => None,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of job classes this engine dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobClass {
    #[serde(rename = "webhook-inbound")]
    WebhookInbound,
    #[serde(rename = "ai-response")]
    AiResponse,
    #[serde(rename = "message-delivery")]
    MessageDelivery,
    #[serde(rename = "notification")]
    Notification,
    #[serde(rename = "cleanup")]
    Cleanup,
    #[serde(rename = "chat-relay-processing")]
    ChatRelayProcessing,
}

impl JobClass {
    pub const ALL: [JobClass; 6] = [
        JobClass::WebhookInbound,
        JobClass::AiResponse,
        JobClass::MessageDelivery,
        JobClass::Notification,
        JobClass::Cleanup,
        JobClass::ChatRelayProcessing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebhookInbound => "webhook-inbound",
            Self::AiResponse => "ai-response",
            Self::MessageDelivery => "message-delivery",
            Self::Notification => "notification",
            Self::Cleanup => "cleanup",
            Self::ChatRelayProcessing => "chat-relay-processing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "webhook-inbound" => Some(Self::WebhookInbound),
            "ai-response" => Some(Self::AiResponse),
            "message-delivery" => Some(Self::MessageDelivery),
            "notification" => Some(Self::Notification),
            "cleanup" => Some(Self::Cleanup),
            "chat-relay-processing" => Some(Self::ChatRelayProcessing),
            _ => None,
        }
    }

    /// Worker-pool parallelism budget.
    pub fn concurrency(&self) -> usize {
        match self {
            Self::WebhookInbound => 5,
            Self::AiResponse => 3,
            Self::MessageDelivery => 3,
            Self::Notification => 2,
            Self::Cleanup => 1,
            Self::ChatRelayProcessing => 4,
        }
    }

    /// Default attempt cap, boosted for urgent traffic on the inbound
    /// classes.
    pub fn default_max_attempts(&self, priority: JobPriority) -> u32 {
        let urgent = priority == JobPriority::Urgent;
        match self {
            Self::WebhookInbound => {
                if urgent {
                    5
                } else {
                    3
                }
            }
            Self::AiResponse => 2,
            Self::MessageDelivery => 3,
            Self::Notification => 3,
            Self::Cleanup => 1,
            Self::ChatRelayProcessing => {
                if urgent {
                    3
                } else {
                    2
                }
            }
        }
    }

    /// Retention cap for the completed set.
    pub fn remove_on_complete(&self, priority: JobPriority) -> u32 {
        let urgent = priority == JobPriority::Urgent;
        match self {
            Self::WebhookInbound | Self::ChatRelayProcessing => {
                if urgent {
                    200
                } else {
                    100
                }
            }
            Self::Cleanup => 50,
            _ => 100,
        }
    }

    /// Retention cap for the failed set.
    pub fn remove_on_fail(&self, priority: JobPriority) -> u32 {
        let urgent = priority == JobPriority::Urgent;
        match self {
            Self::WebhookInbound | Self::ChatRelayProcessing => {
                if urgent {
                    100
                } else {
                    50
                }
            }
            _ => 50,
        }
    }

    /// Handler invocation budget.
    pub fn handler_timeout_ms(&self) -> u64 {
        match self {
            Self::AiResponse => 45_000,
            _ => 30_000,
        }
    }

    /// Which tenant session kind the worker opens for this class.
    pub fn session_kind(&self) -> SessionKind {
        match self {
            Self::WebhookInbound | Self::MessageDelivery => SessionKind::Webhook,
            Self::AiResponse | Self::ChatRelayProcessing => SessionKind::Ai,
            Self::Notification | Self::Cleanup => SessionKind::Generic,
        }
    }

    /// Whether a `merchant_id` is mandatory at enqueue time.
    pub fn requires_tenant(&self) -> bool {
        !matches!(self, Self::Notification | Self::Cleanup)
    }
}

impl std::fmt::Display for JobClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state. A job occupies exactly one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "delayed")]
    Delayed,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(Self::Waiting),
            "delayed" => Some(Self::Delayed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry backoff policy descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    Exponential { base_delay_ms: u64 },
}

impl BackoffPolicy {
    pub fn base_delay_ms(&self) -> u64 {
        match self {
            Self::Exponential { base_delay_ms } => *base_delay_ms,
        }
    }

    /// Jittered delay before the next attempt, given the attempts already
    /// made (including the one that just failed).
    pub fn next_delay_ms(&self, attempts_made: u32) -> u64 {
        crate::error::backoff_delay_ms(self.base_delay_ms(), attempts_made)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_delay_ms: 2_000,
        }
    }
}

/// Inbound platform webhook event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEventPayload {
    pub event_id: String,
    pub platform: String,
    pub event: serde_json::Value,
}

/// Request to generate (and enqueue delivery of) an AI reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiResponsePayload {
    pub conversation_id: String,
    pub customer_id: String,
    pub message: String,
    pub platform: String,
}

/// Outbound message delivery through a platform client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDeliveryPayload {
    pub conversation_id: String,
    pub recipient_id: String,
    pub message: String,
    pub platform: String,
}

/// Operator or system notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPayload {
    pub topic: String,
    pub body: String,
}

/// Periodic maintenance work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupPayload {
    pub target: String,
    #[serde(default)]
    pub older_than_ms: Option<u64>,
}

/// ManyChat relay event with conversation context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRelayPayload {
    pub event_id: String,
    pub username: String,
    pub conversation_id: String,
    pub incoming_message_id: String,
    pub message_text: String,
    #[serde(default)]
    pub image_refs: Vec<String>,
    #[serde(default)]
    pub session_data: serde_json::Value,
}

/// Sum type over job classes. The variant always matches the job's class.
///
/// Encoding is class-directed (see [`JobPayload::from_json`]): the class
/// field of the record picks the variant, so no tag is stored in the payload
/// JSON itself.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    WebhookInbound(WebhookEventPayload),
    AiResponse(AiResponsePayload),
    MessageDelivery(MessageDeliveryPayload),
    Notification(NotificationPayload),
    Cleanup(CleanupPayload),
    ChatRelay(ChatRelayPayload),
}

impl JobPayload {
    pub fn class(&self) -> JobClass {
        match self {
            Self::WebhookInbound(_) => JobClass::WebhookInbound,
            Self::AiResponse(_) => JobClass::AiResponse,
            Self::MessageDelivery(_) => JobClass::MessageDelivery,
            Self::Notification(_) => JobClass::Notification,
            Self::Cleanup(_) => JobClass::Cleanup,
            Self::ChatRelay(_) => JobClass::ChatRelayProcessing,
        }
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(match self {
            Self::WebhookInbound(p) => serde_json::to_string(p)?,
            Self::AiResponse(p) => serde_json::to_string(p)?,
            Self::MessageDelivery(p) => serde_json::to_string(p)?,
            Self::Notification(p) => serde_json::to_string(p)?,
            Self::Cleanup(p) => serde_json::to_string(p)?,
            Self::ChatRelay(p) => serde_json::to_string(p)?,
        })
    }

    /// Decode a payload for a known class. A decode failure is payload
    /// corruption, not a serialization bug: the record came from Redis.
    pub fn from_json(class: JobClass, raw: &str) -> EngineResult<Self> {
        let corrupt = |e: serde_json::Error| {
            EngineError::PayloadCorrupt(format!("{} payload: {}", class, e))
        };
        Ok(match class {
            JobClass::WebhookInbound => {
                Self::WebhookInbound(serde_json::from_str(raw).map_err(corrupt)?)
            }
            JobClass::AiResponse => Self::AiResponse(serde_json::from_str(raw).map_err(corrupt)?),
            JobClass::MessageDelivery => {
                Self::MessageDelivery(serde_json::from_str(raw).map_err(corrupt)?)
            }
            JobClass::Notification => {
                Self::Notification(serde_json::from_str(raw).map_err(corrupt)?)
            }
            JobClass::Cleanup => Self::Cleanup(serde_json::from_str(raw).map_err(corrupt)?),
            JobClass::ChatRelayProcessing => {
                Self::ChatRelay(serde_json::from_str(raw).map_err(corrupt)?)
            }
        })
    }
}

/// Options accepted at enqueue time; unset fields fall back to per-class
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<JobPriority>,
    pub delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retention_on_complete: Option<u32>,
    pub retention_on_fail: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub class: JobClass,
    pub payload: JobPayload,
    pub merchant_id: Option<String>,
    pub priority: JobPriority,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Epoch millis before which the job is ineligible; 0 = immediate.
    pub delay_until: i64,
    pub backoff: BackoffPolicy,
    pub enqueued_at: i64,
    pub dispatched_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub state: JobState,
    pub remove_on_complete: u32,
    pub remove_on_fail: u32,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
}

/// Multiplier separating the priority tier from the enqueue timestamp in a
/// waiting-set score. Epoch millis stay below 1e13 for the next ~280 years,
/// and 4e13 + 1e13 is exactly representable in an f64.
pub const PRIORITY_SCORE_BASE: f64 = 1e13;

impl Job {
    /// Build a new job in `waiting` or `delayed` state with defaults
    /// resolved from the class table.
    pub fn new(
        payload: JobPayload,
        merchant_id: Option<String>,
        options: EnqueueOptions,
    ) -> EngineResult<Self> {
        let class = payload.class();
        if class.requires_tenant() && merchant_id.as_deref().is_none_or(str::is_empty) {
            return Err(EngineError::Config(format!(
                "class '{}' requires a merchant_id",
                class
            )));
        }

        let priority = options.priority.unwrap_or_default();
        let now = Utc::now().timestamp_millis();
        let delay_ms = options.delay_ms.unwrap_or(0);
        let (state, delay_until) = if delay_ms > 0 {
            (JobState::Delayed, now + delay_ms as i64)
        } else {
            (JobState::Waiting, 0)
        };

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            class,
            payload,
            merchant_id,
            priority,
            attempts_made: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or_else(|| class.default_max_attempts(priority)),
            delay_until,
            backoff: options.backoff.unwrap_or_default(),
            enqueued_at: now,
            dispatched_at: None,
            completed_at: None,
            state,
            remove_on_complete: options
                .retention_on_complete
                .unwrap_or_else(|| class.remove_on_complete(priority)),
            remove_on_fail: options
                .retention_on_fail
                .unwrap_or_else(|| class.remove_on_fail(priority)),
            worker_id: None,
            last_error: None,
        })
    }

    /// Score used in the waiting set: ascending `(priority, enqueued_at)`.
    pub fn waiting_score(&self) -> f64 {
        waiting_score(self.priority, self.enqueued_at)
    }

    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Serialize to the Redis hash-field record.
    pub fn to_hash_fields(&self) -> EngineResult<Vec<(&'static str, String)>> {
        let mut fields = vec![
            ("id", self.id.clone()),
            ("class", self.class.as_str().to_string()),
            ("payload", self.payload.to_json()?),
            ("priority", self.priority.as_u8().to_string()),
            ("attempts_made", self.attempts_made.to_string()),
            ("max_attempts", self.max_attempts.to_string()),
            ("delay_until", self.delay_until.to_string()),
            ("backoff_base_ms", self.backoff.base_delay_ms().to_string()),
            ("enqueued_at", self.enqueued_at.to_string()),
            ("state", self.state.as_str().to_string()),
            ("remove_on_complete", self.remove_on_complete.to_string()),
            ("remove_on_fail", self.remove_on_fail.to_string()),
        ];
        if let Some(merchant) = &self.merchant_id {
            fields.push(("merchant_id", merchant.clone()));
        }
        if let Some(at) = self.dispatched_at {
            fields.push(("dispatched_at", at.to_string()));
        }
        if let Some(at) = self.completed_at {
            fields.push(("completed_at", at.to_string()));
        }
        if let Some(worker) = &self.worker_id {
            fields.push(("worker_id", worker.clone()));
        }
        if let Some(err) = &self.last_error {
            fields.push(("last_error", err.clone()));
        }
        Ok(fields)
    }

    /// Decode a job from its Redis hash record.
    ///
    /// Missing required fields or undecodable values are
    /// [`EngineError::PayloadCorrupt`]; an unrecognized class is
    /// [`EngineError::UnknownJobClass`] so the polling loop can distinguish
    /// the two removal reasons.
    pub fn from_hash(map: &HashMap<String, String>) -> EngineResult<Self> {
        fn required<'a>(
            map: &'a HashMap<String, String>,
            field: &str,
        ) -> EngineResult<&'a String> {
            map.get(field)
                .ok_or_else(|| EngineError::PayloadCorrupt(format!("missing field '{}'", field)))
        }

        fn parse_num<T: std::str::FromStr>(raw: &str, field: &str) -> EngineResult<T> {
            raw.parse().map_err(|_| {
                EngineError::PayloadCorrupt(format!("field '{}' is not numeric: {}", field, raw))
            })
        }

        let class_raw = required(map, "class")?;
        let class = JobClass::parse(class_raw)
            .ok_or_else(|| EngineError::UnknownJobClass(class_raw.clone()))?;

        let priority_raw = required(map, "priority")?;
        let priority = JobPriority::parse(priority_raw).ok_or_else(|| {
            EngineError::PayloadCorrupt(format!("unrecognized priority: {}", priority_raw))
        })?;

        let state_raw = required(map, "state")?;
        let state = JobState::parse(state_raw).ok_or_else(|| {
            EngineError::PayloadCorrupt(format!("unrecognized state: {}", state_raw))
        })?;

        let payload = JobPayload::from_json(class, required(map, "payload")?)?;

        Ok(Self {
            id: required(map, "id")?.clone(),
            class,
            payload,
            merchant_id: map.get("merchant_id").cloned(),
            priority,
            attempts_made: parse_num(required(map, "attempts_made")?, "attempts_made")?,
            max_attempts: parse_num(required(map, "max_attempts")?, "max_attempts")?,
            delay_until: map
                .get("delay_until")
                .map(|v| parse_num(v, "delay_until"))
                .transpose()?
                .unwrap_or(0),
            backoff: BackoffPolicy::Exponential {
                base_delay_ms: map
                    .get("backoff_base_ms")
                    .map(|v| parse_num(v, "backoff_base_ms"))
                    .transpose()?
                    .unwrap_or(2_000),
            },
            enqueued_at: parse_num(required(map, "enqueued_at")?, "enqueued_at")?,
            dispatched_at: map
                .get("dispatched_at")
                .map(|v| parse_num(v, "dispatched_at"))
                .transpose()?,
            completed_at: map
                .get("completed_at")
                .map(|v| parse_num(v, "completed_at"))
                .transpose()?,
            state,
            remove_on_complete: map
                .get("remove_on_complete")
                .map(|v| parse_num(v, "remove_on_complete"))
                .transpose()?
                .unwrap_or_else(|| class.remove_on_complete(priority)),
            remove_on_fail: map
                .get("remove_on_fail")
                .map(|v| parse_num(v, "remove_on_fail"))
                .transpose()?
                .unwrap_or_else(|| class.remove_on_fail(priority)),
            worker_id: map.get("worker_id").cloned(),
            last_error: map.get("last_error").cloned(),
        })
    }
}

/// Composite waiting-set score for `(priority, enqueued_at)` ordering.
pub fn waiting_score(priority: JobPriority, enqueued_at: i64) -> f64 {
    priority.as_u8() as f64 * PRIORITY_SCORE_BASE + enqueued_at as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_relay_payload() -> JobPayload {
        JobPayload::ChatRelay(ChatRelayPayload {
            event_id: "evt-1".into(),
            username: "customer".into(),
            conversation_id: "conv-1".into(),
            incoming_message_id: "msg-1".into(),
            message_text: "hello".into(),
            image_refs: vec![],
            session_data: serde_json::json!({}),
        })
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::Urgent < JobPriority::High);
        assert!(JobPriority::High < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::Low);
        assert_eq!(JobPriority::Urgent.as_u8(), 1);
        assert_eq!(JobPriority::Low.as_u8(), 4);
    }

    #[test]
    fn test_priority_parse_canonical_and_numeric() {
        assert_eq!(JobPriority::parse("urgent"), Some(JobPriority::Urgent));
        assert_eq!(JobPriority::parse("normal"), Some(JobPriority::Normal));
        assert_eq!(JobPriority::parse("2"), Some(JobPriority::High));
        assert_eq!(JobPriority::parse("bogus"), None);
    }

    #[test]
    fn test_priority_parse_legacy_literals() {
        assert_eq!(JobPriority::parse("CRITICAL"), Some(JobPriority::Urgent));
        assert_eq!(JobPriority::parse("MEDIUM"), Some(JobPriority::Normal));
        assert_eq!(JobPriority::parse("HIGH"), Some(JobPriority::High));
        assert_eq!(JobPriority::parse("LOW"), Some(JobPriority::Low));
    }

    #[test]
    fn test_class_round_trip() {
        for class in JobClass::ALL {
            assert_eq!(JobClass::parse(class.as_str()), Some(class));
        }
        assert_eq!(JobClass::parse("legacy-unknown"), None);
    }

    #[test]
    fn test_class_defaults_table() {
        use JobPriority::{Normal, Urgent};

        assert_eq!(JobClass::WebhookInbound.concurrency(), 5);
        assert_eq!(JobClass::Cleanup.concurrency(), 1);

        assert_eq!(JobClass::WebhookInbound.default_max_attempts(Normal), 3);
        assert_eq!(JobClass::WebhookInbound.default_max_attempts(Urgent), 5);
        assert_eq!(JobClass::AiResponse.default_max_attempts(Urgent), 2);
        assert_eq!(JobClass::ChatRelayProcessing.default_max_attempts(Normal), 2);
        assert_eq!(JobClass::ChatRelayProcessing.default_max_attempts(Urgent), 3);

        assert_eq!(JobClass::WebhookInbound.remove_on_complete(Normal), 100);
        assert_eq!(JobClass::WebhookInbound.remove_on_complete(Urgent), 200);
        assert_eq!(JobClass::Cleanup.remove_on_complete(Normal), 50);
        assert_eq!(JobClass::ChatRelayProcessing.remove_on_fail(Urgent), 100);
        assert_eq!(JobClass::Notification.remove_on_fail(Urgent), 50);
    }

    #[test]
    fn test_handler_timeouts() {
        assert_eq!(JobClass::AiResponse.handler_timeout_ms(), 45_000);
        assert_eq!(JobClass::WebhookInbound.handler_timeout_ms(), 30_000);
    }

    #[test]
    fn test_session_kinds() {
        assert_eq!(JobClass::WebhookInbound.session_kind(), SessionKind::Webhook);
        assert_eq!(JobClass::MessageDelivery.session_kind(), SessionKind::Webhook);
        assert_eq!(JobClass::AiResponse.session_kind(), SessionKind::Ai);
        assert_eq!(
            JobClass::ChatRelayProcessing.session_kind(),
            SessionKind::Ai
        );
        assert_eq!(JobClass::Notification.session_kind(), SessionKind::Generic);
        assert_eq!(JobClass::Cleanup.session_kind(), SessionKind::Generic);
    }

    #[test]
    fn test_tenant_requirement() {
        assert!(JobClass::WebhookInbound.requires_tenant());
        assert!(JobClass::AiResponse.requires_tenant());
        assert!(!JobClass::Notification.requires_tenant());
        assert!(!JobClass::Cleanup.requires_tenant());

        let err = Job::new(chat_relay_payload(), None, EnqueueOptions::default()).unwrap_err();
        assert!(err.to_string().contains("merchant_id"));
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new(
            chat_relay_payload(),
            Some("M1".into()),
            EnqueueOptions::default(),
        )
        .unwrap();

        assert_eq!(job.class, JobClass::ChatRelayProcessing);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 2);
        assert_eq!(job.delay_until, 0);
        assert_eq!(job.remove_on_complete, 100);
        assert!(job.can_retry());
    }

    #[test]
    fn test_new_job_with_delay_is_delayed() {
        let job = Job::new(
            chat_relay_payload(),
            Some("M1".into()),
            EnqueueOptions {
                delay_ms: Some(5_000),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(job.state, JobState::Delayed);
        assert!(job.delay_until > job.enqueued_at);
    }

    #[test]
    fn test_waiting_score_orders_priority_before_time() {
        let early_low = waiting_score(JobPriority::Low, 1_000);
        let late_urgent = waiting_score(JobPriority::Urgent, 2_000_000_000_000);
        assert!(late_urgent < early_low);

        let first = waiting_score(JobPriority::Normal, 1_000);
        let second = waiting_score(JobPriority::Normal, 2_000);
        assert!(first < second);
    }

    #[test]
    fn test_hash_round_trip() {
        let mut job = Job::new(
            chat_relay_payload(),
            Some("M1".into()),
            EnqueueOptions {
                priority: Some(JobPriority::High),
                max_attempts: Some(7),
                ..Default::default()
            },
        )
        .unwrap();
        job.last_error = Some("downstream 503".into());
        job.worker_id = Some("worker-1".into());

        let fields = job.to_hash_fields().unwrap();
        let map: HashMap<String, String> = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let decoded = Job::from_hash(&map).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_from_hash_missing_payload_is_corrupt() {
        let job = Job::new(chat_relay_payload(), Some("M1".into()), Default::default()).unwrap();
        let mut map: HashMap<String, String> = job
            .to_hash_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        map.remove("payload");

        let err = Job::from_hash(&map).unwrap_err();
        assert!(matches!(err, EngineError::PayloadCorrupt(_)));
    }

    #[test]
    fn test_from_hash_unknown_class() {
        let job = Job::new(chat_relay_payload(), Some("M1".into()), Default::default()).unwrap();
        let mut map: HashMap<String, String> = job
            .to_hash_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        map.insert("class".into(), "legacy-unknown".into());

        let err = Job::from_hash(&map).unwrap_err();
        assert!(matches!(err, EngineError::UnknownJobClass(_)));
    }

    #[test]
    fn test_from_hash_legacy_priority_migrates() {
        let job = Job::new(chat_relay_payload(), Some("M1".into()), Default::default()).unwrap();
        let mut map: HashMap<String, String> = job
            .to_hash_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        map.insert("priority".into(), "CRITICAL".into());

        let decoded = Job::from_hash(&map).unwrap();
        assert_eq!(decoded.priority, JobPriority::Urgent);
    }

    #[test]
    fn test_backoff_policy_delay() {
        let policy = BackoffPolicy::Exponential { base_delay_ms: 100 };
        let delay = policy.next_delay_ms(1);
        assert!((90..=110).contains(&delay), "got {}", delay);

        let delay = policy.next_delay_ms(2);
        assert!((180..=220).contains(&delay), "got {}", delay);
    }

    #[test]
    fn test_payload_json_round_trip() {
        let payload = chat_relay_payload();
        let json = payload.to_json().unwrap();
        let decoded = JobPayload::from_json(JobClass::ChatRelayProcessing, &json).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_payload_wrong_shape_is_corrupt() {
        let err = JobPayload::from_json(JobClass::AiResponse, "{\"nope\":1}").unwrap_err();
        assert!(matches!(err, EngineError::PayloadCorrupt(_)));
    }
}
