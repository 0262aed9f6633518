//! Redis-backed distributed tier.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tracing::debug;

use crate::cache::DistributedCache;
use crate::error::StoreError;

/// [`DistributedCache`] over a `deadpool-redis` pool.
///
/// Keys are prefixed with `namespace:` so several deployments can share one
/// Redis database.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
    namespace: String,
}

impl RedisCache {
    /// Creates a client using `pool`.
    pub fn new(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    /// Creates a pool from a `redis://` URL.
    pub fn from_url(url: &str, namespace: impl Into<String>) -> std::result::Result<Self, StoreError> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
        Ok(Self::new(pool, namespace))
    }

    fn key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.namespace)
        }
    }

    /// Returns whether a connection can be checked out.
    pub async fn is_available(&self) -> bool {
        self.pool.get().await.is_ok()
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.get(self.key(key)).await?;
        debug!(key = %key, hit = value.is_some(), "redis get");
        Ok(value)
    }

    async fn set_ex(
        &self,
        key: &str,
        ttl: Duration,
        value: String,
    ) -> std::result::Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        // SETEX rejects a zero expiry.
        let ttl_secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.key(key), value, ttl_secs).await?;
        debug!(key = %key, ttl_secs, "redis setex");
        Ok(())
    }

    async fn del(&self, key: &str) -> std::result::Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(self.key(key)).await?;
        debug!(key = %key, "redis del");
        Ok(())
    }
}
