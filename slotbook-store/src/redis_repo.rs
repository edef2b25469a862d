use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use std::time::Duration;
use tracing::debug;

use slotbook_core::{CacheBackend, CacheError};

/// Shared Redis store behind [`CacheBackend`].
#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, CacheError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(to_cache_error)
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(to_cache_error)?;
        Ok(())
    }
}

fn to_cache_error(e: RedisError) -> CacheError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        CacheError::Connection(e.to_string())
    } else {
        CacheError::Command(e.to_string())
    }
}

/// Redis expiry is whole seconds; never round a live key down to "no expiry".
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheBackend for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(to_cache_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl_seconds(ttl))
                .await
                .map_err(to_cache_error),
            None => conn.set::<_, _, ()>(key, value).await.map_err(to_cache_error),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(to_cache_error)?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        let mut conn = self.conn().await?;
        conn.incr(key, by).await.map_err(|e| {
            if e.to_string().contains("not an integer") {
                CacheError::NotAnInteger(key.to_string())
            } else {
                to_cache_error(e)
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let applied: bool = conn
            .expire(key, ttl_seconds(ttl) as i64)
            .await
            .map_err(to_cache_error)?;
        debug!(key = %key, applied, "Redis EXPIRE");
        Ok(applied)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        conn.exists(key).await.map_err(to_cache_error)
    }
}
