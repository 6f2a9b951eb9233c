//! In-process cache backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::{CacheBackend, LockArgs, LockGuard};
use crate::error::{CacheError, LockError};

/// How often a contended lock is re-tried.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A thread-safe, in-memory lockable cache.
///
/// Clones share the same state, so one instance can stand in for the
/// shared cache server of several throttles within a process.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

struct Inner {
    /// Bucket records indexed by key
    entries: DashMap<String, Entry>,
    /// Currently held locks indexed by name
    locks: Mutex<HashMap<String, HeldLock>>,
    poll_interval: Duration,
}

struct Entry {
    value: f64,
    expires_at: Instant,
}

struct HeldLock {
    token: Uuid,
    expires_at: Instant,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create an empty cache that re-tries contended locks every `poll_interval`.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                locks: Mutex::new(HashMap::new()),
                poll_interval,
            }),
        }
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all records and locks.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.inner.entries.clear();
        self.inner.locks.lock().clear();
    }

    fn try_lock(&self, name: &str, ttl: Duration) -> Option<Uuid> {
        let now = Instant::now();
        let mut locks = self.inner.locks.lock();

        if let Some(held) = locks.get(name) {
            if held.expires_at > now {
                return None;
            }
        }

        let token = Uuid::new_v4();
        locks.insert(
            name.to_string(),
            HeldLock {
                token,
                expires_at: now + ttl,
            },
        );
        Some(token)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<f64>, CacheError> {
        let now = Instant::now();
        let expired = match self.inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value)),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.inner
                .entries
                .remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: f64, ttl: Duration) -> Result<(), CacheError> {
        self.inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn lock(&self, name: &str, args: &LockArgs) -> Result<Box<dyn LockGuard>, LockError> {
        let start = Instant::now();

        loop {
            if let Some(token) = self.try_lock(name, args.timeout) {
                trace!(name = %name, token = %token, "Acquired lock");
                return Ok(Box::new(MemoryLockGuard {
                    cache: self.clone(),
                    name: name.to_string(),
                    token,
                }));
            }

            let waited = start.elapsed();
            if waited >= args.blocking_timeout {
                return Err(LockError::Acquire {
                    name: name.to_string(),
                    waited,
                });
            }

            let remaining = args.blocking_timeout - waited;
            tokio::time::sleep(self.inner.poll_interval.min(remaining)).await;
        }
    }
}

/// Guard returned by [`MemoryCache::lock`].
struct MemoryLockGuard {
    cache: MemoryCache,
    name: String,
    token: Uuid,
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let now = Instant::now();
        let mut locks = self.cache.inner.locks.lock();

        let owned = matches!(locks.get(&self.name), Some(held) if held.token == self.token);
        if !owned {
            return Err(LockError::NotOwned {
                name: self.name.clone(),
            });
        }

        match locks.remove(&self.name) {
            Some(held) if held.expires_at > now => {
                trace!(name = %self.name, token = %self.token, "Released lock");
                Ok(())
            }
            _ => Err(LockError::NotOwned {
                name: self.name.clone(),
            }),
        }
    }
}

impl Drop for MemoryLockGuard {
    /// Frees the lock when the guard is dropped without `release`, for
    /// example when the holding future is cancelled.
    fn drop(&mut self) {
        let mut locks = self.cache.inner.locks.lock();
        if matches!(locks.get(&self.name), Some(held) if held.token == self.token) {
            locks.remove(&self.name);
            trace!(name = %self.name, token = %self.token, "Released dropped lock");
        }
    }
}
