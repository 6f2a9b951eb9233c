//! Redis-backed cache and lock.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{CacheBackend, LockArgs, LockGuard};
use crate::error::{CacheError, LockError};

/// Deletes the lock only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Lock retry interval, matching redis-py's default.
const LOCK_SLEEP: Duration = Duration::from_millis(100);

/// Cache backend storing bucket records and the throttle lock in Redis.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    /// Connect to the Redis server at `redis_url`.
    pub async fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }

    /// Test the Redis connection.
    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut connection = self.connection.clone();
        redis::cmd("PING").query_async(&mut connection).await
    }
}

fn as_millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<f64>, CacheError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        raw.map(|value| {
            value.parse::<f64>().map_err(|_| CacheError::InvalidValue {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
    }

    async fn set(&self, key: &str, value: f64, ttl: Duration) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value.to_string())
            .arg("PX")
            .arg(as_millis(ttl))
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn lock(&self, name: &str, args: &LockArgs) -> Result<Box<dyn LockGuard>, LockError> {
        let mut connection = self.connection.clone();
        let token = Uuid::new_v4().to_string();
        let start = Instant::now();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(name)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(as_millis(args.timeout))
                .query_async(&mut connection)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;

            if acquired.is_some() {
                trace!(name = %name, token = %token, "Acquired Redis lock");
                return Ok(Box::new(RedisLockGuard {
                    connection,
                    name: name.to_string(),
                    token,
                    released: false,
                }));
            }

            let waited = start.elapsed();
            if waited >= args.blocking_timeout {
                debug!(name = %name, waited = ?waited, "Redis lock acquisition timed out");
                return Err(LockError::Acquire {
                    name: name.to_string(),
                    waited,
                });
            }

            tokio::time::sleep(LOCK_SLEEP.min(args.blocking_timeout - waited)).await;
        }
    }
}

struct RedisLockGuard {
    connection: ConnectionManager,
    name: String,
    token: String,
    released: bool,
}

impl RedisLockGuard {
    async fn delete(
        mut connection: ConnectionManager,
        name: &str,
        token: &str,
    ) -> Result<i64, LockError> {
        Script::new(RELEASE_SCRIPT)
            .key(name)
            .arg(token)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

#[async_trait]
impl LockGuard for RedisLockGuard {
    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let mut guard = self;
        let deleted = Self::delete(guard.connection.clone(), &guard.name, &guard.token).await;
        guard.released = true;

        if deleted? == 0 {
            return Err(LockError::NotOwned {
                name: guard.name.clone(),
            });
        }
        Ok(())
    }
}

impl Drop for RedisLockGuard {
    /// Frees the lock in the background when the guard is dropped without
    /// `release`, for example when the holding future is cancelled.
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(name = %self.name, "No runtime to release dropped Redis lock; it will expire");
            return;
        };

        let connection = self.connection.clone();
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            match Self::delete(connection, &name, &token).await {
                Ok(_) => trace!(name = %name, "Released dropped Redis lock"),
                Err(e) => warn!(name = %name, error = %e, "Failed to release dropped Redis lock"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running Redis instance.
    // They are ignored by default. Run with: cargo test --features redis -- --ignored

    async fn create_test_cache() -> Option<RedisCache> {
        RedisCache::new("redis://127.0.0.1:6379").await.ok()
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_set_get() {
        let Some(cache) = create_test_cache().await else {
            return;
        };

        cache
            .set("gatekeeper:test:bucket", 42.5, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            cache.get("gatekeeper:test:bucket").await.unwrap(),
            Some(42.5)
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_lock_is_exclusive() {
        let Some(cache) = create_test_cache().await else {
            return;
        };
        let args = LockArgs::new(Duration::from_secs(1), Duration::ZERO);

        let guard = cache.lock("gatekeeper:test:lock", &args).await.unwrap();
        assert!(cache.lock("gatekeeper:test:lock", &args).await.is_err());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_dropped_guard_frees_lock() {
        let Some(cache) = create_test_cache().await else {
            return;
        };
        let args = LockArgs::new(Duration::from_secs(10), Duration::from_millis(500));

        let guard = cache.lock("gatekeeper:test:dropped", &args).await.unwrap();
        drop(guard);

        let guard = cache.lock("gatekeeper:test:dropped", &args).await.unwrap();
        guard.release().await.unwrap();
    }
}
