//! Redis connectivity for the job engine.
//!
//! This crate owns every Redis client handle in the system. Consumers request
//! a handle for a *usage class* (queue backend, cache, rate limiting) from the
//! [`redis::ConnectionHub`] and never hold one across reconnection events:
//! after a connection-category error, ask the hub for a fresh handle before
//! retrying.
//!
//! # Examples
//!
//! ```ignore
//! use database::redis::{ConnectionHub, RedisConfig, UsageClass};
//!
//! let hub = ConnectionHub::new(RedisConfig::new("redis://127.0.0.1:6379"));
//! let queue_conn = hub.get(UsageClass::QueueBackend).await?;
//! let status = hub.health_check(UsageClass::QueueBackend).await;
//! ```

pub mod common;
pub mod redis;

pub use common::{DatabaseError, DatabaseResult};
