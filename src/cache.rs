use crate::error::StoreError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Client interface for the shared key-value tier (e.g. Redis).
///
/// Values are opaque strings; the tiered cache stores JSON.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Reads a key; `None` when absent or expired.
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError>;

    /// Writes a key that expires server-side after `ttl`.
    async fn set_ex(
        &self,
        key: &str,
        ttl: Duration,
        value: String,
    ) -> std::result::Result<(), StoreError>;

    /// Deletes a key.
    async fn del(&self, key: &str) -> std::result::Result<(), StoreError>;
}

/// No-op distributed tier; every read misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDistributedCache;

#[async_trait]
impl DistributedCache for NoDistributedCache {
    async fn get(&self, _key: &str) -> std::result::Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn set_ex(
        &self,
        _key: &str,
        _ttl: Duration,
        _value: String,
    ) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    async fn del(&self, _key: &str) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}

/// Source-of-truth loader behind a tiered cache.
///
/// `Ok(None)` means the source has nothing for this key.
#[async_trait]
pub trait Loader<T>: Send + Sync {
    async fn load(&self) -> std::result::Result<Option<T>, StoreError>;
}

/// Adapts an async closure into a [`Loader`].
#[derive(Clone)]
pub struct FnLoader<F>(pub F);

#[async_trait]
impl<T, F, Fut> Loader<T> for FnLoader<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Option<T>, StoreError>> + Send,
{
    async fn load(&self) -> std::result::Result<Option<T>, StoreError> {
        (self.0)().await
    }
}
