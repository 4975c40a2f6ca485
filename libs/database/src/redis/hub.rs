//! Usage-class scoped connection handles.
//!
//! Different engine concerns get separate Redis handles so a slow queue
//! drain cannot starve cache lookups and vice versa. The hub owns every
//! handle; callers receive clones of the `ConnectionManager` (use, not
//! ownership) and must come back to the hub after a connection-category
//! error instead of retrying on a stale handle.

use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::health::{check_health_detailed, HealthStatus};
use super::{connect_with_retry, RedisConfig};
use crate::common::{DatabaseResult, RetryConfig};

/// What a connection handle is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageClass {
    /// Queue state: job records, waiting/delayed/active sets
    QueueBackend,
    /// Application cache reads and writes
    Cache,
    /// Rate-limit bookkeeping
    RateLimit,
}

impl UsageClass {
    pub const ALL: [UsageClass; 3] = [
        UsageClass::QueueBackend,
        UsageClass::Cache,
        UsageClass::RateLimit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueBackend => "queue-backend",
            Self::Cache => "cache",
            Self::RateLimit => "rate-limit",
        }
    }
}

impl std::fmt::Display for UsageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns one lazily-established `ConnectionManager` per usage class.
pub struct ConnectionHub {
    config: RedisConfig,
    retry: RetryConfig,
    handles: RwLock<HashMap<UsageClass, ConnectionManager>>,
}

impl ConnectionHub {
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            retry: RetryConfig::default(),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Override the connect-retry policy (startup wants more patience than
    /// a mid-flight refresh).
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Get a handle for the given usage class, connecting lazily on first
    /// use. May block briefly while the connection is established.
    pub async fn get(&self, usage: UsageClass) -> DatabaseResult<ConnectionManager> {
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(&usage) {
                return Ok(handle.clone());
            }
        }

        let mut handles = self.handles.write().await;
        // Another task may have connected while we waited for the lock.
        if let Some(handle) = handles.get(&usage) {
            return Ok(handle.clone());
        }

        info!(usage = %usage, "Establishing Redis connection");
        let manager = connect_with_retry(&self.config.url, Some(self.retry.clone())).await?;
        handles.insert(usage, manager.clone());
        Ok(manager)
    }

    /// Drop the cached handle for a usage class and reconnect.
    ///
    /// Callers invoke this after an operation failed with a
    /// connection-category error, then retry on the returned handle.
    pub async fn refresh(&self, usage: UsageClass) -> DatabaseResult<ConnectionManager> {
        warn!(usage = %usage, "Refreshing Redis connection");
        {
            let mut handles = self.handles.write().await;
            handles.remove(&usage);
        }
        self.get(usage).await
    }

    /// Round-trip health check for a usage class, within the 2s budget.
    ///
    /// A class that has never connected is connected first; failure to
    /// connect is reported as unhealthy rather than an error.
    pub async fn health_check(&self, usage: UsageClass) -> HealthStatus {
        let start = std::time::Instant::now();
        match self.get(usage).await {
            Ok(manager) => {
                let mut conn = manager;
                check_health_detailed(&mut conn).await
            }
            Err(e) => HealthStatus::unhealthy(e.to_string(), start.elapsed().as_millis() as u64),
        }
    }

    /// Drop all handles. Idempotent; subsequent `get` calls reconnect.
    pub async fn close_all(&self) {
        let mut handles = self.handles.write().await;
        let count = handles.len();
        handles.clear();
        if count > 0 {
            info!(count, "Closed Redis connection handles");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_class_labels() {
        assert_eq!(UsageClass::QueueBackend.as_str(), "queue-backend");
        assert_eq!(UsageClass::Cache.as_str(), "cache");
        assert_eq!(UsageClass::RateLimit.as_str(), "rate-limit");
        assert_eq!(UsageClass::ALL.len(), 3);
    }

    #[tokio::test]
    async fn test_close_all_idempotent() {
        let hub = ConnectionHub::new(RedisConfig::default());
        hub.close_all().await;
        hub.close_all().await;
    }

    #[tokio::test]
    async fn test_health_check_unreachable_reports_unhealthy() {
        let hub = ConnectionHub::new(RedisConfig::new("redis://127.0.0.1:1"))
            .with_retry_config(RetryConfig::new().with_max_retries(0).with_initial_delay(1));

        let status = hub.health_check(UsageClass::Cache).await;
        assert!(!status.healthy);
        assert!(status.message.is_some());
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_get_and_refresh() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let hub = ConnectionHub::new(RedisConfig::new(url));

        let _first = hub.get(UsageClass::QueueBackend).await.unwrap();
        let _again = hub.get(UsageClass::QueueBackend).await.unwrap();
        let _fresh = hub.refresh(UsageClass::QueueBackend).await.unwrap();

        let status = hub.health_check(UsageClass::QueueBackend).await;
        assert!(status.healthy);
    }
}
