use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

use crate::{Client, CustomRedisError};

pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    /// Create a new RedisClient without timeouts.
    pub async fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        Self::with_config(addr, None, None).await
    }

    /// Create a new RedisClient with optional response and connection timeouts.
    ///
    /// `None` means no timeout. Passing `Some(Duration::ZERO)` is rejected with
    /// `CustomRedisError::InvalidConfiguration`.
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        if response_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis response timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }
        if connection_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }
        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisClient { connection })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn zadd_nx(
        &self,
        k: String,
        member: String,
        score: i64,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let added: i64 = redis::cmd("ZADD")
            .arg(k)
            .arg("NX")
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    async fn zadd_gt(&self, k: String, member: String, score: i64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        redis::cmd("ZADD")
            .arg(k)
            .arg("GT")
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zpopmin(&self, k: String, count: u64) -> Result<Vec<(String, i64)>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(k)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(popped
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn zcard(&self, k: String) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: u64 = redis::cmd("ZCARD").arg(k).query_async(&mut conn).await?;
        Ok(result)
    }

    async fn zscore(&self, k: String, member: String) -> Result<Option<i64>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(k)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score.map(|s| s as i64))
    }

    async fn hset_nx(
        &self,
        k: String,
        field: String,
        v: String,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let set: i64 = redis::cmd("HSETNX")
            .arg(k)
            .arg(field)
            .arg(v)
            .query_async(&mut conn)
            .await?;
        Ok(set > 0)
    }

    async fn hget(&self, k: String, field: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();
        let result: Option<String> = redis::cmd("HGET")
            .arg(k)
            .arg(field)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(value) => Ok(value),
            None => Err(CustomRedisError::NotFound),
        }
    }

    async fn hdel(&self, k: String, field: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        redis::cmd("HDEL")
            .arg(k)
            .arg(field)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}
