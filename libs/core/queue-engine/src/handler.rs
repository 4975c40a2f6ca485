//! Handler contract and the per-class dispatch registry.

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{EngineError, EngineResult, ErrorCategory};
use crate::job::{Job, JobClass};
use crate::session::TenantSession;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Failure declared by a handler.
///
/// Handlers pick the category; anything they cannot classify should use
/// [`HandlerError::retryable`] — the worker boundary falls back to retryable
/// for unclassified errors anyway.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient failure (downstream 5xx, transient DB contention).
    #[error("retryable: {0}")]
    Retryable(String),

    /// Terminal failure (validation, auth, policy).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Retryable(_) => ErrorCategory::Transient,
            Self::Permanent(_) => ErrorCategory::Permanent,
        }
    }
}

/// Cancellation context passed into every handler invocation.
///
/// Derived from the engine shutdown signal; handlers surface it through
/// their own I/O (`tokio::select!` against [`HandlerContext::cancelled`]).
#[derive(Clone)]
pub struct HandlerContext {
    shutdown: watch::Receiver<bool>,
}

impl HandlerContext {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    /// Non-blocking cancellation check.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when shutdown is signaled. Never resolves spuriously.
    pub async fn cancelled(&self) {
        let mut rx = self.shutdown.clone();
        if *rx.borrow() {
            return;
        }
        // The sender living for the engine's lifetime means changed() only
        // errs after shutdown has been signaled or the engine dropped.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// A job-class handler implemented by an external collaborator.
///
/// Returns a class-specific result value on success. Persistence access
/// goes through the injected tenant session only.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        session: &mut dyn TenantSession,
        job: &Job,
    ) -> Result<serde_json::Value, HandlerError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

/// Registry entry: the handler plus its runtime budget and breaker.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn JobHandler>,
    pub concurrency: usize,
    pub breaker: Arc<CircuitBreaker>,
}

/// Dispatch table mapping each job class to its handler entry.
///
/// Built once during initialization; registering a class twice is a fatal
/// initialization error.
pub struct HandlerRegistry {
    breaker_config: CircuitBreakerConfig,
    entries: HashMap<JobClass, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            breaker_config,
            entries: HashMap::new(),
        }
    }

    /// Register a handler for a class. `concurrency` falls back to the
    /// class budget when `None`.
    pub fn register(
        &mut self,
        class: JobClass,
        handler: Arc<dyn JobHandler>,
        concurrency: Option<usize>,
    ) -> EngineResult<()> {
        if self.entries.contains_key(&class) {
            return Err(EngineError::DuplicateHandler(class.as_str().to_string()));
        }

        let breaker = Arc::new(CircuitBreaker::new(
            class.as_str(),
            self.breaker_config.clone(),
        ));
        self.entries.insert(
            class,
            HandlerEntry {
                handler,
                concurrency: concurrency.unwrap_or_else(|| class.concurrency()).max(1),
                breaker,
            },
        );
        Ok(())
    }

    pub fn get(&self, class: JobClass) -> Option<&HandlerEntry> {
        self.entries.get(&class)
    }

    pub fn contains(&self, class: JobClass) -> bool {
        self.entries.contains_key(&class)
    }

    /// Registered classes in stable (declaration) order.
    pub fn classes(&self) -> Vec<JobClass> {
        JobClass::ALL
            .into_iter()
            .filter(|c| self.entries.contains_key(c))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Breaker snapshots for diagnostics.
    pub fn breaker_snapshots(&self) -> Vec<crate::circuit::CircuitBreakerSnapshot> {
        self.classes()
            .into_iter()
            .filter_map(|c| self.entries.get(&c))
            .map(|e| e.breaker.snapshot())
            .collect()
    }
}
