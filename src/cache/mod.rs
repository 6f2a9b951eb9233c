//! Cache and lock backend abstraction.
//!
//! The throttle treats the backend as the single source of truth for the
//! last permitted call time of every bucket. Any store that can `get`, `set`
//! with a TTL and hand out a named mutual-exclusion lock can back it.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CacheError, LockError};

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

/// Arguments passed to [`CacheBackend::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockArgs {
    /// Lifetime of a held lock before the backend may expire it.
    pub timeout: Duration,
    /// Maximum time to wait for the lock before failing.
    pub blocking_timeout: Duration,
}

impl LockArgs {
    pub fn new(timeout: Duration, blocking_timeout: Duration) -> Self {
        Self {
            timeout,
            blocking_timeout,
        }
    }
}

/// A held lock.
///
/// Release consumes the guard and fails if ownership was lost while held
/// (for example because the lock's own timeout elapsed).
#[async_trait]
pub trait LockGuard: Send {
    async fn release(self: Box<Self>) -> Result<(), LockError>;
}

/// Trait for cache/lock backends shared by all throttling processes.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Read the timestamp stored under `key`, if any and not expired.
    async fn get(&self, key: &str) -> Result<Option<f64>, CacheError>;

    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: f64, ttl: Duration) -> Result<(), CacheError>;

    /// Acquire the named lock, waiting at most `args.blocking_timeout`.
    async fn lock(&self, name: &str, args: &LockArgs) -> Result<Box<dyn LockGuard>, LockError>;
}
