//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that creates a Redis container for testing.

use redis::aio::ConnectionManager;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: ConnectionManager,
    pub connection_string: String,
}

impl TestRedis {
    /// Start a fresh Redis container (Redis 8 Alpine) and connect to it.
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client =
            Client::open(connection_string.clone()).expect("Failed to create Redis client");

        let connection = ConnectionManager::new(client)
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Get a cloned connection manager (useful for passing to components)
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    #[tokio::test]
    async fn test_redis_set_get() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.set::<_, _, ()>("test_key", "test_value")
            .await
            .unwrap();

        let value: String = conn.get("test_key").await.unwrap();
        assert_eq!(value, "test_value");
    }

    #[tokio::test]
    async fn test_redis_sorted_set_operations() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.zadd::<_, _, _, ()>("test_zset", "a", 3).await.unwrap();
        conn.zadd::<_, _, _, ()>("test_zset", "b", 1).await.unwrap();
        conn.zadd::<_, _, _, ()>("test_zset", "c", 2).await.unwrap();

        let ordered: Vec<String> = conn.zrange("test_zset", 0, -1).await.unwrap();
        assert_eq!(ordered, vec!["b", "c", "a"]);

        let removed: i64 = conn.zrem("test_zset", "b").await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_redis_hash_operations() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.hset::<_, _, _, ()>("test_hash", "state", "waiting")
            .await
            .unwrap();
        conn.hset::<_, _, _, ()>("test_hash", "attempts", "0")
            .await
            .unwrap();

        let state: String = conn.hget("test_hash", "state").await.unwrap();
        assert_eq!(state, "waiting");

        let all: std::collections::HashMap<String, String> =
            conn.hgetall("test_hash").await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
