//! Error types for Ratewarden.

use thiserror::Error;

use crate::ratelimit::ViolationKind;

/// Status code carried by every rate limit violation ("too many requests").
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// The counter store could not be reached or the operation did not complete.
    ///
    /// Never implies a count: callers choose whether to fail open or closed.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A rate limit check failed.
    #[error("{message}")]
    RateLimitExceeded {
        kind: ViolationKind,
        message: String,
        code: u16,
    },

    /// A rate limit check failed and a caller-supplied error factory built the error.
    #[error("{0}")]
    Rejected(Box<dyn std::error::Error + Send + Sync>),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Arguments outside the counter store contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Whether this error came from the backing store rather than a limit decision.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, WardenError::StoreUnavailable(_))
    }

    /// Whether this error is a limit violation, built-in or factory-made.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            WardenError::RateLimitExceeded { .. } | WardenError::Rejected(_)
        )
    }

    /// The status code of a built-in violation.
    pub fn code(&self) -> Option<u16> {
        match self {
            WardenError::RateLimitExceeded { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for WardenError {
    fn from(err: redis::RedisError) -> Self {
        WardenError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display_uses_message() {
        let err = WardenError::RateLimitExceeded {
            kind: ViolationKind::TooManyRequests,
            message: "slow down".to_string(),
            code: TOO_MANY_REQUESTS,
        };
        assert_eq!(err.to_string(), "slow down");
        assert_eq!(err.code(), Some(429));
        assert!(err.is_rate_limited());
        assert!(!err.is_store_unavailable());
    }

    #[test]
    fn test_store_unavailable_is_distinct() {
        let err = WardenError::StoreUnavailable("connection refused".to_string());
        assert!(err.is_store_unavailable());
        assert!(!err.is_rate_limited());
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_redis_error_maps_to_store_unavailable() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "timed out"));
        let err: WardenError = redis_err.into();
        assert!(err.is_store_unavailable());
    }
}
