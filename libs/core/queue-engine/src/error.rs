//! Engine error taxonomy and retry classification.
//!
//! Every failure the engine can observe maps onto one of three categories:
//! - `Transient`: retry with exponential backoff
//! - `Permanent`: terminal, no retry
//! - `RateLimited`: provider-signaled cap; the polling loop throttles itself
//!
//! Handlers declare their own category through [`crate::handler::HandlerError`];
//! everything else is classified here.

use database::DatabaseError;
use thiserror::Error;

/// Errors produced by the engine itself.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Redis command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connectivity-layer error (connect, auth, health)
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A labeled timeout fired
    #[error("Operation '{label}' timed out after {budget_ms}ms")]
    Timeout { label: String, budget_ms: u64 },

    /// Provider-signaled request-cap exceedance
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// A collaborator circuit breaker is open
    #[error("Circuit open for {collaborator}")]
    CircuitOpen { collaborator: String },

    /// A persisted job names a class this engine does not know
    #[error("Unknown job class: {0}")]
    UnknownJobClass(String),

    /// A job record is missing required fields or fails to decode
    #[error("Corrupt job payload: {0}")]
    PayloadCorrupt(String),

    /// The same job class was registered twice
    #[error("Handler already registered for class '{0}'")]
    DuplicateHandler(String),

    /// The engine has not been initialized (or has been shut down)
    #[error("not initialized")]
    NotInitialized,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Classify the error for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Redis(e) => categorize_redis_text(&e.to_string()),

            Self::Database(e) => match e {
                DatabaseError::AuthFailed(_) | DatabaseError::ConfigError(_) => {
                    ErrorCategory::Permanent
                }
                _ => ErrorCategory::Transient,
            },

            Self::Timeout { .. } => ErrorCategory::Transient,
            Self::RateLimited(_) => ErrorCategory::RateLimited,
            // Retryable once the reset timeout elapses
            Self::CircuitOpen { .. } => ErrorCategory::Transient,
            Self::Internal(_) => ErrorCategory::Transient,

            Self::Serialization(_)
            | Self::UnknownJobClass(_)
            | Self::PayloadCorrupt(_)
            | Self::DuplicateHandler(_)
            | Self::NotInitialized
            | Self::Config(_) => ErrorCategory::Permanent,
        }
    }

    /// Whether this is a rate-limit-category error (steers the polling
    /// loop's adaptive throttle).
    pub fn is_rate_limited(&self) -> bool {
        self.category() == ErrorCategory::RateLimited
    }

    /// Whether a fresh connection handle might fix this.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let lower = e.to_string().to_lowercase();
                lower.contains("connection")
                    || lower.contains("disconnected")
                    || lower.contains("broken pipe")
                    || lower.contains("reset by peer")
                    || lower.contains("refused")
                    || lower.contains("io error")
            }
            Self::Database(e) => e.is_connection_error(),
            _ => false,
        }
    }
}

/// Map raw Redis error text onto a category.
///
/// Hosted Redis signals request caps in the error string ("max requests limit
/// exceeded"), so the text is the only classification channel available.
fn categorize_redis_text(text: &str) -> ErrorCategory {
    let lower = text.to_lowercase();
    if lower.contains("max requests")
        || lower.contains("rate limit")
        || lower.contains("limit exceeded")
        || lower.contains("too many requests")
        || lower.contains("busy")
        || lower.contains("loading")
    {
        ErrorCategory::RateLimited
    } else {
        ErrorCategory::Transient
    }
}

/// Error category for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary; retry with exponential backoff.
    Transient,

    /// Will not be fixed by retrying; job goes terminal.
    Permanent,

    /// Service is shedding load; back off much longer.
    RateLimited,
}

impl ErrorCategory {
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::Permanent)
    }

    /// Metric label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Delay before retry attempt number `attempts_made` (1-based: the value of
/// `attempts_made` after the failing dispatch), as
/// `base_delay_ms * 2^(attempts_made - 1)` with ±10% jitter.
pub fn backoff_delay_ms(base_delay_ms: u64, attempts_made: u32) -> u64 {
    let exponent = attempts_made.saturating_sub(1).min(16);
    let raw = base_delay_ms.saturating_mul(2u64.pow(exponent));
    apply_jitter(raw)
}

/// Apply ±10% jitter to a delay to avoid thundering-herd retries.
fn apply_jitter(delay_ms: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::SystemTime;

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    let hash = hasher.finish();

    let jitter_range = delay_ms / 10;
    if jitter_range == 0 {
        return delay_ms;
    }

    let offset = (hash % (jitter_range * 2 + 1)) as i64 - jitter_range as i64;
    if offset < 0 {
        delay_ms.saturating_sub((-offset) as u64)
    } else {
        delay_ms.saturating_add(offset as u64)
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
