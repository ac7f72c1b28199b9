use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use redis::ErrorKind as RedisErrorKind;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl CustomRedisError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// Determine if this error is unrecoverable and should not be retried
    ///
    /// Returns `true` for configuration errors and permanent failures,
    /// `false` for transient network/connection issues.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self {
            CustomRedisError::Timeout => false,
            CustomRedisError::InvalidConfiguration(_) => true,
            CustomRedisError::ParseError(_) => true,
            CustomRedisError::NotFound => true,
            CustomRedisError::Redis(err) => {
                matches!(
                    err.kind(),
                    redis::ErrorKind::InvalidClientConfig | redis::ErrorKind::AuthenticationFailed
                ) || err.is_unrecoverable_error()
            }
        }
    }
}

/// Sorted set and hash operations used by the work queue and the dedup ledger.
///
/// Scores are integer milliseconds. Redis stores them as doubles, which is
/// exact for any wall-clock millisecond timestamp.
#[async_trait]
pub trait Client {
    /// `ZADD key NX score member`: returns true if the member was added,
    /// false if it was already present (its score is left untouched).
    async fn zadd_nx(&self, k: String, member: String, score: i64)
        -> Result<bool, CustomRedisError>;

    /// `ZADD key GT score member`: adds the member, or raises its score.
    /// An existing higher score is never lowered.
    async fn zadd_gt(&self, k: String, member: String, score: i64) -> Result<(), CustomRedisError>;

    /// `ZPOPMIN key count`: removes and returns up to `count` members with
    /// the lowest scores, lowest first.
    async fn zpopmin(&self, k: String, count: u64) -> Result<Vec<(String, i64)>, CustomRedisError>;

    async fn zcard(&self, k: String) -> Result<u64, CustomRedisError>;

    async fn zscore(&self, k: String, member: String) -> Result<Option<i64>, CustomRedisError>;

    /// `HSETNX key field value`: returns true if the field was set.
    async fn hset_nx(&self, k: String, field: String, v: String)
        -> Result<bool, CustomRedisError>;

    /// Returns `CustomRedisError::NotFound` when the field is absent.
    async fn hget(&self, k: String, field: String) -> Result<String, CustomRedisError>;

    async fn hdel(&self, k: String, field: String) -> Result<(), CustomRedisError>;
}

mod client;
mod mock;

pub use client::RedisClient;
pub use mock::{MockRedisCall, MockRedisClient};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_recoverable() {
        let err = CustomRedisError::Timeout;
        assert!(!err.is_unrecoverable_error());
    }

    #[test]
    fn test_parse_error_is_unrecoverable() {
        let err = CustomRedisError::ParseError("invalid data".to_string());
        assert!(err.is_unrecoverable_error());
    }

    #[test]
    fn test_invalid_client_config_is_unrecoverable() {
        let err = CustomRedisError::from_redis_kind(
            RedisErrorKind::InvalidClientConfig,
            "Redis URL did not parse",
        );
        assert!(err.is_unrecoverable_error());
    }

    #[test]
    fn test_authentication_failed_is_unrecoverable() {
        let err =
            CustomRedisError::from_redis_kind(RedisErrorKind::AuthenticationFailed, "bad password");
        assert!(err.is_unrecoverable_error());
    }

    #[test]
    fn test_io_error_delegation() {
        let custom_err = CustomRedisError::from_redis_kind(RedisErrorKind::IoError, "test error");
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "test error"));
        assert_eq!(
            custom_err.is_unrecoverable_error(),
            redis_err.is_unrecoverable_error()
        );
    }
}
