//! Multi-tenant, Redis-backed job processing engine.
//!
//! Ingests inbound messaging-platform events (Instagram/WhatsApp webhooks,
//! ManyChat relays) and outbound AI-generated replies, dispatches them
//! through typed per-class worker pools, and guarantees bounded latency and
//! at-least-once delivery under partial Redis failure.
//!
//! # Architecture
//!
//! ```text
//! enqueue APIs (EnqueueProducer)
//!   ↓
//! QueueCore  (Redis ZSET/HASH state machine, CAS transitions)
//!   ↓                         ↑ steers
//! Dispatcher ←─ shares ─→ PollingLoop      HealthMonitor
//!   (per-class pools)     (fallback scan)  (timers + recommendations)
//!   ↓
//! JobHandler (external collaborator, under a tenant session
//!             and a per-class circuit breaker)
//! ```
//!
//! The [`EngineSupervisor`] brings the components up in dependency order
//! and tears them down leaves-last with a drain deadline.
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_engine::{
//!     EngineSettings, EngineSupervisor, HandlerRegistry, JobClass,
//! };
//!
//! let mut registry = HandlerRegistry::new(settings.breaker_config());
//! registry.register(JobClass::WebhookInbound, Arc::new(WebhookHandler::new(repos)), None)?;
//! registry.register(JobClass::AiResponse, Arc::new(AiReplyHandler::new(orchestrator)), None)?;
//!
//! let engine = EngineSupervisor::initialize(settings, registry, sessions, observers).await?;
//! let producer = engine.producer();
//!
//! let ack = producer
//!     .enqueue_webhook("evt-1", event, "merchant-1", "instagram", None)
//!     .await;
//!
//! // ... on SIGTERM:
//! engine.shutdown().await;
//! ```

mod admin;
mod circuit;
mod dlq;
mod error;
mod handler;
mod health;
mod job;
pub mod metrics;
mod observer;
mod poller;
mod producer;
mod queue;
mod session;
mod settings;
mod supervisor;
mod timeout;
mod worker;

pub use admin::{admin_router, AdminState};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use dlq::{DlqEntry, DlqManager, DlqStats};
pub use error::{backoff_delay_ms, EngineError, EngineResult, ErrorCategory};
pub use handler::{HandlerContext, HandlerEntry, HandlerError, HandlerRegistry, JobHandler};
pub use health::{
    recommendations, HealthMonitor, HealthMonitorConfig, HealthReport, RedisHealth, WorkerStatus,
};
pub use job::{
    waiting_score, AiResponsePayload, BackoffPolicy, ChatRelayPayload, CleanupPayload,
    EnqueueOptions, Job, JobClass, JobPayload, JobPriority, JobState, MessageDeliveryPayload,
    NotificationPayload, WebhookEventPayload, PRIORITY_SCORE_BASE,
};
pub use observer::QueueObserver;
pub use poller::{PollingLoop, RATE_LIMIT_BACKOFF_MS};
pub use producer::{EnqueueAck, EnqueueProducer};
pub use queue::{
    FailureOutcome, QueueCore, QueueKeys, QueueStatsSnapshot, StateCounts, DEFAULT_LEASE_MS,
};
pub use session::{SessionKind, TenantSession, TenantSessionProvider};
pub use settings::EngineSettings;
pub use supervisor::{EngineSupervisor, InitDiagnostics, InitStep};
pub use timeout::with_timeout;
pub use worker::Dispatcher;
