use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::cache::DistributedCache;
use crate::error::StoreError;

/// Process-local stand-in for the distributed tier.
///
/// Entries expire after the TTL given to `set_ex`, like Redis `SETEX`, and the
/// least recently used key is evicted once `capacity` is exceeded. Intended
/// for tests and single-instance deployments. [`MemoryDistributedCache::set_available`]
/// simulates an outage: every call fails until it is turned back on.
#[derive(Debug, Clone)]
pub struct MemoryDistributedCache {
    inner: Arc<Mutex<CacheState>>,
    available: Arc<AtomicBool>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryDistributedCache {
    /// Creates a new cache with the given capacity.
    ///
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheState::default())),
            available: Arc::new(AtomicBool::new(true)),
            capacity,
        }
    }

    /// Turns the simulated connection on or off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Returns whether no live entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> std::result::Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("distributed cache unavailable".into())
        }
    }

    fn remove_key(state: &mut CacheState, key: &str) {
        if state.entries.remove(key).is_some() {
            state.order.retain(|existing| existing != key);
        }
    }

    fn touch(state: &mut CacheState, key: &str) {
        state.order.retain(|existing| existing != key);
        state.order.push_back(key.to_string());
    }

    fn prune_expired(state: &mut CacheState, now: Instant) {
        state.entries.retain(|_, entry| entry.expires_at > now);
        let CacheState { entries, order } = state;
        order.retain(|key| entries.contains_key(key));
    }

    fn evict_if_needed(state: &mut CacheState, capacity: usize) {
        while state.entries.len() > capacity {
            if let Some(key) = state.order.pop_front() {
                state.entries.remove(&key);
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        self.check_available()?;
        if self.capacity == 0 {
            return Ok(None);
        }

        let now = Instant::now();
        let mut guard = self.lock();
        let expired = match guard.entries.get(key) {
            Some(entry) => entry.expires_at <= now,
            None => return Ok(None),
        };
        if expired {
            Self::remove_key(&mut guard, key);
            return Ok(None);
        }

        let value = guard.entries.get(key).map(|entry| entry.value.clone());
        Self::touch(&mut guard, key);
        Ok(value)
    }

    async fn set_ex(
        &self,
        key: &str,
        ttl: Duration,
        value: String,
    ) -> std::result::Result<(), StoreError> {
        self.check_available()?;
        if self.capacity == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let mut guard = self.lock();
        Self::prune_expired(&mut guard, now);
        guard.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
        Self::touch(&mut guard, key);
        Self::evict_if_needed(&mut guard, self.capacity);
        Ok(())
    }

    async fn del(&self, key: &str) -> std::result::Result<(), StoreError> {
        self.check_available()?;
        let mut guard = self.lock();
        Self::remove_key(&mut guard, key);
        Ok(())
    }
}
