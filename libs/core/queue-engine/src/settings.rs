//! Engine configuration surface.

use crate::circuit::CircuitBreakerConfig;
use crate::health::HealthMonitorConfig;
use core_config::{env_flag, env_or_default, env_parse_or, ConfigError, Environment, FromEnv};
use database::redis::RedisConfig;

/// Everything the engine reads at startup. Every field has an env-var
/// override; the struct is also a builder for embedding and tests.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub redis: RedisConfig,
    pub environment: Environment,
    /// Installation-wide key prefix; multiple engines may share a Redis
    /// instance under different names.
    pub queue_name: String,
    /// When set, overrides the per-class attempt defaults for jobs whose
    /// enqueue options omit `max_attempts`. Unset means the class table
    /// applies.
    pub default_max_attempts: Option<u32>,
    pub default_backoff_base_ms: u64,
    pub poll_interval_ms: u64,
    pub queue_health_interval_ms: u64,
    pub worker_health_interval_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_reset_ms: u64,
    /// Inject a synthetic probe job shortly after initialization. Ignored
    /// in production.
    pub enable_queue_tests: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            environment: Environment::Development,
            queue_name: "relay".to_string(),
            default_max_attempts: None,
            default_backoff_base_ms: 2_000,
            poll_interval_ms: 5_000,
            queue_health_interval_ms: 30_000,
            worker_health_interval_ms: 60_000,
            shutdown_deadline_ms: 30_000,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_ms: 60_000,
            enable_queue_tests: false,
        }
    }
}

impl EngineSettings {
    pub fn new(redis: RedisConfig) -> Self {
        Self {
            redis,
            ..Default::default()
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    pub fn with_shutdown_deadline_ms(mut self, deadline: u64) -> Self {
        self.shutdown_deadline_ms = deadline;
        self
    }

    pub fn with_default_backoff_base_ms(mut self, base: u64) -> Self {
        self.default_backoff_base_ms = base;
        self
    }

    pub fn with_queue_tests(mut self, enabled: bool) -> Self {
        self.enable_queue_tests = enabled;
        self
    }

    /// Breaker parameters for handler circuits.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            reset_timeout_ms: self.circuit_breaker_reset_ms,
        }
    }

    /// Monitor cadences derived from these settings.
    pub fn monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            queue_health_interval_ms: self.queue_health_interval_ms,
            worker_health_interval_ms: self.worker_health_interval_ms,
            ..Default::default()
        }
    }

    /// Whether the startup probe job should be injected.
    pub fn probe_job_enabled(&self) -> bool {
        self.enable_queue_tests && !self.environment.is_production()
    }
}

impl FromEnv for EngineSettings {
    /// Environment variables: `REDIS_URL`/`REDIS_HOST` (required),
    /// `QUEUE_NAME`, `DEFAULT_MAX_ATTEMPTS`, `DEFAULT_BACKOFF_BASE_MS`,
    /// `POLL_INTERVAL_MS`, `QUEUE_HEALTH_INTERVAL_MS`,
    /// `WORKER_HEALTH_INTERVAL_MS`, `SHUTDOWN_DEADLINE_MS`,
    /// `CIRCUIT_BREAKER_FAILURE_THRESHOLD`, `CIRCUIT_BREAKER_RESET_MS`,
    /// `ENABLE_QUEUE_TESTS`, plus `APP_ENV` for the environment.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            redis: RedisConfig::from_env()?,
            environment: Environment::from_env(),
            queue_name: env_or_default("QUEUE_NAME", &defaults.queue_name),
            default_max_attempts: match std::env::var("DEFAULT_MAX_ATTEMPTS") {
                Ok(raw) => Some(raw.parse().map_err(|e| ConfigError::ParseError {
                    key: "DEFAULT_MAX_ATTEMPTS".to_string(),
                    details: format!("{}", e),
                })?),
                Err(_) => None,
            },
            default_backoff_base_ms: env_parse_or(
                "DEFAULT_BACKOFF_BASE_MS",
                defaults.default_backoff_base_ms,
            )?,
            poll_interval_ms: env_parse_or("POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            queue_health_interval_ms: env_parse_or(
                "QUEUE_HEALTH_INTERVAL_MS",
                defaults.queue_health_interval_ms,
            )?,
            worker_health_interval_ms: env_parse_or(
                "WORKER_HEALTH_INTERVAL_MS",
                defaults.worker_health_interval_ms,
            )?,
            shutdown_deadline_ms: env_parse_or(
                "SHUTDOWN_DEADLINE_MS",
                defaults.shutdown_deadline_ms,
            )?,
            circuit_breaker_failure_threshold: env_parse_or(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                defaults.circuit_breaker_failure_threshold,
            )?,
            circuit_breaker_reset_ms: env_parse_or(
                "CIRCUIT_BREAKER_RESET_MS",
                defaults.circuit_breaker_reset_ms,
            )?,
            enable_queue_tests: env_flag("ENABLE_QUEUE_TESTS"),
        })
    }
}
