//! Shared test infrastructure.
//!
//! Provides [`TestRedis`]: a disposable Redis container for integration
//! tests, cleaned up automatically on drop.
//!
//! ```rust,ignore
//! use redis::AsyncCommands;
//! use test_utils::TestRedis;
//!
//! #[tokio::test]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let mut conn = redis.connection();
//!
//!     conn.set::<_, _, ()>("key", "value").await.unwrap();
//!     let value: String = conn.get("key").await.unwrap();
//!     assert_eq!(value, "value");
//! }
//! ```

mod redis;

pub use redis::TestRedis;
