use redis::aio::ConnectionManager;
use redis::Client;
use tracing::info;

use super::RedisConfig;
use crate::common::{retry_with_backoff, DatabaseError, DatabaseResult, RetryConfig};

/// Connect to Redis and return a `ConnectionManager`
///
/// The `ConnectionManager` transparently reconnects after transient failures;
/// the initial connection is verified with a PING so a bad URL fails here
/// rather than on first use.
pub async fn connect(url: &str) -> DatabaseResult<ConnectionManager> {
    info!("Connecting to Redis at {}", RedisConfig::redact(url));

    let client = Client::open(url).map_err(DatabaseError::from_connect_error)?;
    let manager = ConnectionManager::new(client)
        .await
        .map_err(DatabaseError::from_connect_error)?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(DatabaseError::from_connect_error)?;

    info!("Connected to Redis");
    Ok(manager)
}

/// Connect using a [`RedisConfig`]
pub async fn connect_from_config(config: &RedisConfig) -> DatabaseResult<ConnectionManager> {
    connect(&config.url).await
}

/// Connect to Redis with automatic retry on failure
///
/// Uses exponential backoff with jitter for transient startup issues.
///
/// # Example
/// ```ignore
/// use database::common::RetryConfig;
/// use database::redis::connect_with_retry;
///
/// let config = RetryConfig::new().with_max_retries(5);
/// let conn = connect_with_retry("redis://127.0.0.1:6379", Some(config)).await?;
/// ```
pub async fn connect_with_retry(
    url: &str,
    retry_config: Option<RetryConfig>,
) -> DatabaseResult<ConnectionManager> {
    let url_owned = url.to_string();
    let config = retry_config.unwrap_or_default();
    retry_with_backoff(|| connect(&url_owned), config).await
}
