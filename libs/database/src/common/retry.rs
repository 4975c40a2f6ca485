//! Connect-retry policy for the Redis backend.
//!
//! Two callers share this: engine startup, which wants patience while a
//! container or DNS entry settles, and a mid-flight handle refresh, which
//! wants to give up quickly so the outage surfaces to the health monitor.
//! Both are expressed as an attempt budget over a doubling delay schedule.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt budget and delay schedule for establishing a connection.
///
/// The delay before retry `n` doubles from `initial_delay_ms` up to
/// `max_delay_ms`, then gets pulled down by up to a quarter so a fleet of
/// workers restarting together does not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = this + 1).
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,

    /// Ceiling for the doubled delay in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn with_max_delay(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    /// Delay before retrying after failed attempt number `attempt`
    /// (1-based): doubled, capped, then desynchronized downward.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let capped = self
            .initial_delay_ms
            .saturating_mul(2u64.pow(exponent))
            .min(self.max_delay_ms);
        Duration::from_millis(capped - desync_spread(capped))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

/// How much to pull a delay down, at most a quarter of it. Derived from the
/// clock rather than an RNG; lockstep avoidance needs spread, not
/// unpredictability.
fn desync_spread(delay_ms: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::SystemTime;

    let quarter = delay_ms / 4;
    if quarter == 0 {
        return 0;
    }

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    hasher.finish() % (quarter + 1)
}

/// Drive `connect` until it succeeds or the attempt budget is spent.
/// The error from the final attempt is returned as-is.
///
/// # Example
/// ```ignore
/// use database::common::{retry_with_backoff, RetryConfig};
///
/// let config = RetryConfig::new().with_max_retries(5);
/// let conn = retry_with_backoff(|| database::redis::connect(&url), config).await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(mut connect: F, config: RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let error = match connect().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Connection established after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt > config.max_retries {
            warn!(
                attempts = attempt,
                error = %error,
                "Connection attempts exhausted"
            );
            return Err(error);
        }

        let delay = config.delay_for_attempt(attempt);
        debug!(
            attempt,
            budget = config.max_retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Connection attempt failed; retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
