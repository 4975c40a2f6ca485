//! Redis connector, health checks, and the usage-class connection hub

mod config;
mod connector;
mod health;
mod hub;

pub use config::RedisConfig;
pub use connector::{connect, connect_from_config, connect_with_retry};
pub use health::{check_health, check_health_detailed, HealthStatus, HEALTH_CHECK_TIMEOUT_MS};
pub use hub::{ConnectionHub, UsageClass};

// Re-export client types for convenience
pub use redis::aio::ConnectionManager;
pub use redis::{AsyncCommands, Client, RedisResult};
