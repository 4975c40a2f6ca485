//! Circuit breaker guarding outbound collaborators.
//!
//! One breaker wraps each registered job class's handler (the AI
//! orchestrator, platform senders, repositories behind it). The breaker
//! never wraps the Queue Core itself — that would isolate the dispatcher
//! from its own work source.
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │
//! └─────────┘                         └────────┘
//!      ^                                   │ reset timeout elapsed
//!      │ probe succeeds                    v
//!      │                         ┌─────────────┐
//!      └──────────────────────── │  HALF-OPEN  │ ── probe fails ──> OPEN
//!                                └─────────────┘
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// The next request is a recovery probe.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// Breaker parameters.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long to stay open before allowing a probe.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

/// Read-only view of breaker state for diagnostics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub collaborator: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Millis since the circuit opened, when open.
    pub open_for_ms: Option<u64>,
    pub reset_after_ms: u64,
}

/// Thread-safe circuit breaker.
pub struct CircuitBreaker {
    collaborator: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(collaborator: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            collaborator: collaborator.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
        }
    }

    /// The collaborator this breaker guards.
    pub fn collaborator(&self) -> &str {
        &self.collaborator
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Whether a call may proceed. Transitions Open → Half-Open once the
    /// reset timeout has elapsed.
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.reset_elapsed() {
                    self.transition_to_half_open();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            // Probe succeeded (or a stale success raced the open transition)
            CircuitState::HalfOpen | CircuitState::Open => {
                self.transition_to_closed();
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            collaborator: self.collaborator.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            open_for_ms: self
                .opened_at
                .read()
                .unwrap()
                .map(|at| at.elapsed().as_millis() as u64),
            reset_after_ms: self.config.reset_timeout_ms,
        }
    }

    fn reset_elapsed(&self) -> bool {
        match *self.opened_at.read().unwrap() {
            Some(at) => at.elapsed() >= Duration::from_millis(self.config.reset_timeout_ms),
            None => true,
        }
    }

    fn transition_to_open(&self) {
        *self.state.write().unwrap() = CircuitState::Open;
        *self.opened_at.write().unwrap() = Some(Instant::now());
        warn!(collaborator = %self.collaborator, "Circuit breaker OPENED");
    }

    fn transition_to_half_open(&self) {
        *self.state.write().unwrap() = CircuitState::HalfOpen;
        info!(collaborator = %self.collaborator, "Circuit breaker HALF-OPEN (probing)");
    }

    fn transition_to_closed(&self) {
        *self.state.write().unwrap() = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap() = None;
        info!(collaborator = %self.collaborator, "Circuit breaker CLOSED (recovered)");
    }
}
