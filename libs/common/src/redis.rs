//! Pooled Redis access for bus publishing
//!
//! Commands run on `bb8` pooled connections. A pub/sub subscription holds its
//! connection for as long as it lives, so [`RedisClient::pubsub`] opens a
//! dedicated one outside the pool.

use anyhow::{Context, Result};
use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

pub use redis::Msg;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
    pub connect_timeout: Duration,
}

impl RedisConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 4,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct RedisClient {
    pool: Arc<Pool<RedisConnectionManager>>,
    url: String,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedisClient({})", self.url)
    }
}

impl RedisClient {
    /// Connect with default pool settings and check the server answers PING
    pub async fn new(url: &str) -> Result<Self> {
        Self::with_config(RedisConfig::from_url(url)).await
    }

    pub async fn with_config(config: RedisConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.as_str())
            .with_context(|| format!("Invalid Redis URL: {}", config.url))?;
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.connect_timeout)
            .build(manager)
            .await
            .context("Failed to build Redis connection pool")?;

        let client = Self {
            pool: Arc::new(pool),
            url: config.url,
        };
        let _: String = redis::cmd("PING")
            .query_async(&mut *client.connection().await?)
            .await
            .context("Redis did not answer PING")?;
        Ok(client)
    }

    async fn connection(&self) -> Result<PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .context("No Redis connection available")
    }

    /// Returns the number of subscribers that received the message
    pub async fn publish(&self, channel: &str, message: &str) -> Result<u32> {
        let mut conn = self.connection().await?;
        conn.publish(channel, message)
            .await
            .with_context(|| format!("PUBLISH {} failed", channel))
    }

    /// Store `message` under `channel` as a key and publish it, atomically
    ///
    /// Subscribers that attach later read the stored value with GET.
    pub async fn publish_retained(&self, channel: &str, message: &str) -> Result<u32> {
        let mut conn = self.connection().await?;
        let (receivers,): (u32,) = redis::pipe()
            .atomic()
            .set(channel, message)
            .ignore()
            .publish(channel, message)
            .query_async(&mut *conn)
            .await
            .with_context(|| format!("Retained PUBLISH {} failed", channel))?;
        Ok(receivers)
    }

    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        let client = redis::Client::open(self.url.as_str()).context("Invalid Redis URL")?;
        client
            .get_async_pubsub()
            .await
            .context("Failed to open Redis pub/sub connection")
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_config_from_url() {
        let config = RedisConfig::from_url("redis://10.0.0.2:6380");
        assert_eq!(config.url, "redis://10.0.0.2:6380");
        assert_eq!(config.pool_size, 4);
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_retained_publish_is_stored() {
        let client = RedisClient::new("redis://localhost:6379").await.unwrap();
        client
            .publish_retained("health/knx/test", "{\"status\":\"online\"}")
            .await
            .unwrap();
        let mut conn = client.connection().await.unwrap();
        let stored: Option<String> = conn.get("health/knx/test").await.unwrap();
        assert_eq!(stored.as_deref(), Some("{\"status\":\"online\"}"));
        let _: u32 = conn.del("health/knx/test").await.unwrap();
    }
}
