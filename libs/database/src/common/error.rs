/// Unified error type for the connectivity layer
///
/// Connection failures are split into the categories callers react to
/// differently: a `ConnectFailed` warrants a retry with a fresh handle, an
/// `AuthFailed` will not heal on its own, and a `Timeout` is reported as
/// unhealthy without tearing the handle down.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Underlying Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connection could not be established (after retries)
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// Authentication or ACL rejection
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// An operation exceeded its time budget
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Health check failed
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl DatabaseError {
    /// Fold a raw client error into the connect-time taxonomy.
    ///
    /// Auth rejections are surfaced as [`DatabaseError::AuthFailed`] so
    /// callers don't retry a credential problem; everything else from the
    /// connect path is a [`DatabaseError::ConnectFailed`].
    pub fn from_connect_error(e: redis::RedisError) -> Self {
        let text = e.to_string();
        let lower = text.to_lowercase();
        if lower.contains("noauth")
            || lower.contains("wrongpass")
            || lower.contains("invalid password")
            || lower.contains("authentication")
        {
            DatabaseError::AuthFailed(text)
        } else {
            DatabaseError::ConnectFailed(text)
        }
    }

    /// Whether this error indicates a dead connection that a fresh handle
    /// might fix.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::ConnectFailed(_) => true,
            Self::Redis(e) => {
                let lower = e.to_string().to_lowercase();
                lower.contains("connection")
                    || lower.contains("broken pipe")
                    || lower.contains("reset by peer")
                    || lower.contains("refused")
                    || lower.contains("io error")
            }
            _ => false,
        }
    }
}

/// Result type alias for connectivity operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_err(msg: &str) -> redis::RedisError {
        redis::RedisError::from((redis::ErrorKind::Io, "io", msg.to_string()))
    }

    #[test]
    fn test_auth_errors_classified() {
        let err = DatabaseError::from_connect_error(redis_err("WRONGPASS invalid username"));
        assert!(matches!(err, DatabaseError::AuthFailed(_)));

        let err = DatabaseError::from_connect_error(redis_err("NOAUTH Authentication required"));
        assert!(matches!(err, DatabaseError::AuthFailed(_)));
    }

    #[test]
    fn test_other_connect_errors_are_connect_failed() {
        let err = DatabaseError::from_connect_error(redis_err("Connection refused (os error 111)"));
        assert!(matches!(err, DatabaseError::ConnectFailed(_)));
    }

    #[test]
    fn test_is_connection_error() {
        assert!(DatabaseError::ConnectFailed("x".into()).is_connection_error());
        assert!(DatabaseError::Redis(redis_err("broken pipe")).is_connection_error());
        assert!(!DatabaseError::Timeout("ping".into()).is_connection_error());
        assert!(!DatabaseError::AuthFailed("x".into()).is_connection_error());
    }
}
