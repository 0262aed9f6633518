//! Read-through cache with an in-process tier over a distributed tier.
//!
//! Lookup order is in-process (short TTL), then the distributed tier (longer
//! TTL, expired server-side), then the loader. When any step fails the last
//! in-process value is served even if stale; with nothing in process the
//! loader is called directly and its outcome is returned as is.

use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{DistributedCache, Loader, NoDistributedCache};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_DISTRIBUTED_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct MemoryEntry<T> {
    value: T,
    written_at: Instant,
}

// `generation` is bumped by every set/invalidate so a read that started
// before the write cannot put an older value back into either tier.
#[derive(Debug)]
struct MemoryTier<T> {
    entry: Option<MemoryEntry<T>>,
    generation: u64,
}

/// One cached resource backed by a loader.
///
/// Construct one instance per resource at startup and share it by reference
/// (or `Arc`). Concurrent cold reads may each call the loader.
pub struct TieredCache<T, L, D = NoDistributedCache> {
    storage_key: String,
    memory_ttl: Duration,
    distributed_ttl: Duration,
    distributed: D,
    loader: L,
    memory: Mutex<MemoryTier<T>>,
}

/// Builder for [`TieredCache`].
pub struct TieredCacheBuilder<T, L, D = NoDistributedCache> {
    storage_key: String,
    memory_ttl: Duration,
    distributed_ttl: Duration,
    distributed: D,
    loader: L,
    _marker: PhantomData<fn() -> T>,
}

impl<T, L> TieredCacheBuilder<T, L, NoDistributedCache> {
    /// Creates a builder for `storage_key` loading through `loader`.
    pub fn new(storage_key: impl Into<String>, loader: L) -> Self {
        Self {
            storage_key: storage_key.into(),
            memory_ttl: DEFAULT_MEMORY_TTL,
            distributed_ttl: DEFAULT_DISTRIBUTED_TTL,
            distributed: NoDistributedCache,
            loader,
            _marker: PhantomData,
        }
    }
}

impl<T, L, D> TieredCacheBuilder<T, L, D> {
    /// Sets how long an in-process entry is served without I/O.
    pub fn memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl = ttl;
        self
    }

    /// Sets the expiry handed to the distributed tier.
    pub fn distributed_ttl(mut self, ttl: Duration) -> Self {
        self.distributed_ttl = ttl;
        self
    }

    /// Takes both lifetimes from `config`.
    pub fn config(self, config: &CacheConfig) -> Self {
        self.memory_ttl(config.memory_ttl())
            .distributed_ttl(config.distributed_ttl())
    }

    /// Sets the distributed tier client.
    pub fn distributed<D2: DistributedCache>(self, distributed: D2) -> TieredCacheBuilder<T, L, D2> {
        TieredCacheBuilder {
            storage_key: self.storage_key,
            memory_ttl: self.memory_ttl,
            distributed_ttl: self.distributed_ttl,
            distributed,
            loader: self.loader,
            _marker: PhantomData,
        }
    }

    /// Builds the cache.
    pub fn build(self) -> TieredCache<T, L, D> {
        TieredCache {
            storage_key: self.storage_key,
            memory_ttl: self.memory_ttl,
            distributed_ttl: self.distributed_ttl,
            distributed: self.distributed,
            loader: self.loader,
            memory: Mutex::new(MemoryTier {
                entry: None,
                generation: 0,
            }),
        }
    }
}

impl<T, L, D> TieredCache<T, L, D>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
    L: Loader<T>,
    D: DistributedCache,
{
    /// Key used in the distributed tier.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Returns the cached value, loading it on a full miss.
    ///
    /// `Ok(None)` means the loader had nothing to return.
    pub async fn get(&self) -> Result<Option<T>> {
        let generation = {
            let memory = self.lock();
            if let Some(entry) = &memory.entry
                && entry.written_at.elapsed() < self.memory_ttl
            {
                return Ok(Some(entry.value.clone()));
            }
            memory.generation
        };

        match self.read_through(generation).await {
            Ok(value) => Ok(value),
            Err(err) => {
                let stale = self.lock().entry.as_ref().map(|entry| entry.value.clone());
                if let Some(stale) = stale {
                    warn!(key = %self.storage_key, error = %err, "serving stale in-process value");
                    return Ok(Some(stale));
                }
                warn!(key = %self.storage_key, error = %err, "cache read failed, calling loader directly");
                self.loader.load().await.map_err(Error::Cache)
            }
        }
    }

    /// Reads the cached value and projects one field out of it.
    pub async fn project<R>(&self, field: impl FnOnce(&T) -> Option<R>) -> Result<Option<R>> {
        Ok(self.get().await?.as_ref().and_then(field))
    }

    /// Writes `value` through both tiers.
    pub async fn set(&self, value: T) -> Result<()> {
        let raw = serde_json::to_string(&value)?;
        {
            let mut memory = self.lock();
            memory.generation += 1;
            memory.entry = Some(MemoryEntry {
                value,
                written_at: Instant::now(),
            });
        }

        if let Err(err) = self
            .distributed
            .set_ex(&self.storage_key, self.distributed_ttl, raw)
            .await
        {
            warn!(key = %self.storage_key, error = %err, "distributed write failed, dropping key");
            if let Err(del_err) = self.distributed.del(&self.storage_key).await {
                warn!(key = %self.storage_key, error = %del_err, "distributed delete failed");
            }
            return Err(Error::Cache(err));
        }
        debug!(key = %self.storage_key, "cache set (memory+distributed)");
        Ok(())
    }

    /// Drops both tiers so the next read reloads from the source.
    pub async fn invalidate(&self) -> Result<()> {
        {
            let mut memory = self.lock();
            memory.generation += 1;
            memory.entry = None;
        }
        self.distributed
            .del(&self.storage_key)
            .await
            .map_err(Error::Cache)?;
        debug!(key = %self.storage_key, "cache invalidated");
        Ok(())
    }

    async fn read_through(&self, generation: u64) -> Result<Option<T>> {
        if let Some(raw) = self
            .distributed
            .get(&self.storage_key)
            .await
            .map_err(Error::Cache)?
        {
            let value: T = serde_json::from_str(&raw)?;
            debug!(key = %self.storage_key, "cache hit (distributed)");
            self.fill_memory(generation, value.clone());
            return Ok(Some(value));
        }

        let Some(value) = self.loader.load().await.map_err(Error::Cache)? else {
            debug!(key = %self.storage_key, "loader returned nothing");
            return Ok(None);
        };
        debug!(key = %self.storage_key, "cache miss, loaded from source");
        if !self.fill_memory(generation, value.clone()) {
            debug!(key = %self.storage_key, "load superseded by a write, not caching");
            return Ok(Some(value));
        }
        let raw = serde_json::to_string(&value)?;
        self.distributed
            .set_ex(&self.storage_key, self.distributed_ttl, raw)
            .await
            .map_err(Error::Cache)?;
        // A set/invalidate may have finished while our write was in flight.
        if self.lock().generation != generation {
            debug!(key = %self.storage_key, "load superseded during write, dropping key");
            self.distributed
                .del(&self.storage_key)
                .await
                .map_err(Error::Cache)?;
        }
        Ok(Some(value))
    }

    // Returns false when a set/invalidate happened after `generation` was read.
    fn fill_memory(&self, generation: u64, value: T) -> bool {
        let mut memory = self.lock();
        if memory.generation != generation {
            return false;
        }
        memory.entry = Some(MemoryEntry {
            value,
            written_at: Instant::now(),
        });
        true
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTier<T>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
