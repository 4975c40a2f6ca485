use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

use crate::common::DatabaseError;

/// Budget for a health-check round trip. A PING that takes longer than this
/// is reported unhealthy even if it would eventually succeed.
pub const HEALTH_CHECK_TIMEOUT_MS: u64 = 2_000;

/// Check Redis health with a PING round trip
///
/// # Returns
/// * `Ok(())` if Redis answered PONG within the time budget
/// * `Err(DatabaseError)` otherwise
pub async fn check_health(conn: &mut ConnectionManager) -> Result<(), DatabaseError> {
    debug!("Running Redis health check");

    let cmd = redis::cmd("PING");
    let ping = cmd.query_async::<String>(conn);
    let response = tokio::time::timeout(Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS), ping)
        .await
        .map_err(|_| {
            DatabaseError::Timeout(format!(
                "Redis PING exceeded {}ms budget",
                HEALTH_CHECK_TIMEOUT_MS
            ))
        })?
        .map_err(|e| DatabaseError::HealthCheckFailed(format!("Redis PING failed: {}", e)))?;

    if response != "PONG" {
        return Err(DatabaseError::HealthCheckFailed(format!(
            "Redis PING returned unexpected response: {}",
            response
        )));
    }

    Ok(())
}

/// Health check result for detailed status reporting
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether Redis answered within budget
    pub healthy: bool,

    /// Error message when unhealthy
    pub message: Option<String>,

    /// Round-trip latency in milliseconds
    pub latency_ms: u64,
}

impl HealthStatus {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            message: None,
            latency_ms,
        }
    }

    pub fn unhealthy(message: String, latency_ms: u64) -> Self {
        Self {
            healthy: false,
            message: Some(message),
            latency_ms,
        }
    }
}

/// Check Redis health, returning latency and failure detail rather than an
/// error. Used by the monitoring loop and the readiness endpoint.
pub async fn check_health_detailed(conn: &mut ConnectionManager) -> HealthStatus {
    let start = std::time::Instant::now();

    match check_health(conn).await {
        Ok(_) => HealthStatus::healthy(start.elapsed().as_millis() as u64),
        Err(e) => HealthStatus::unhealthy(e.to_string(), start.elapsed().as_millis() as u64),
    }
}
