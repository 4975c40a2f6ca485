//! Typed lifecycle observers.
//!
//! Components subscribe at initialization time and receive completed /
//! failed / stalled notifications with typed arguments — there is no
//! string-keyed event bus.

use crate::job::Job;

/// Subscriber interface for queue lifecycle events.
///
/// All methods default to no-ops so observers implement only what they
/// care about. Callbacks run on the worker's task; keep them cheap.
pub trait QueueObserver: Send + Sync {
    /// A job reached `completed`.
    fn on_completed(&self, _job: &Job, _result: &serde_json::Value) {}

    /// A job attempt failed. `terminal` is true when the job reached
    /// `failed` permanently (out of attempts or permanent error).
    fn on_failed(&self, _job: &Job, _error: &str, _terminal: bool) {}

    /// The worker-health check flagged these jobs as stalled.
    fn on_stalled(&self, _job_ids: &[String]) {}
}
