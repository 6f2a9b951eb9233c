//! The check-and-claim step run under the shared lock.
//!
//! A gate reads the last permitted time of a bucket, compares it with now
//! and either claims the slot by writing now, or reports how long the
//! caller has to wait. Callers must hold the throttle lock for the whole
//! evaluation; the gate itself does no locking.

use std::collections::HashSet;
use std::time::Duration;

use tracing::trace;

use crate::cache::CacheBackend;
use crate::error::CacheError;

/// Name of the lock serializing every gate evaluation.
pub const LOCK_NAME: &str = "throttle.lock";

/// One limit resolved against one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub key: String,
    pub minimum_interval: f64,
    pub expiry: Duration,
}

impl Slot {
    pub fn new(key: impl Into<String>, minimum_interval: f64, expiry: Duration) -> Self {
        Self {
            key: key.into(),
            minimum_interval,
            expiry,
        }
    }
}

/// Check-and-claim over a cache backend.
pub struct Gate<'a> {
    cache: &'a dyn CacheBackend,
}

impl<'a> Gate<'a> {
    pub fn new(cache: &'a dyn CacheBackend) -> Self {
        Self { cache }
    }

    /// Evaluate a single slot at `now`.
    ///
    /// Returns the delay in seconds; zero means the slot was claimed.
    pub async fn evaluate(&self, slot: &Slot, now: f64) -> Result<f64, CacheError> {
        let last = self.cache.get(&slot.key).await?.unwrap_or(0.0);
        let delay = (last + slot.minimum_interval - now).max(0.0);

        trace!(key = %slot.key, last = last, now = now, delay = delay, "Evaluated slot");

        if delay == 0.0 {
            self.cache.set(&slot.key, now, slot.expiry).await?;
        }
        Ok(delay)
    }

    /// Evaluate several slots in order at `now`.
    ///
    /// A key already evaluated in this pass is skipped. The first slot that
    /// needs a delay ends the pass; slots after it are neither checked nor
    /// claimed. Slots claimed before it stay claimed.
    pub async fn evaluate_all(&self, slots: &[Slot], now: f64) -> Result<f64, CacheError> {
        let mut seen = HashSet::with_capacity(slots.len());

        for slot in slots {
            if !seen.insert(slot.key.as_str()) {
                continue;
            }

            let delay = self.evaluate(slot, now).await?;
            if delay > 0.0 {
                return Ok(delay);
            }
        }
        Ok(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn slot(key: &str, rate: f64) -> Slot {
        Slot::new(key, 1.0 / rate, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_empty_bucket_is_claimed() {
        let cache = MemoryCache::new();
        let gate = Gate::new(&cache);

        let delay = gate.evaluate(&slot("a", 10.0), 100.0).await.unwrap();

        assert_eq!(delay, 0.0);
        assert_eq!(cache.get("a").await.unwrap(), Some(100.0));
    }

    #[tokio::test]
    async fn test_recent_call_is_delayed_without_claim() {
        let cache = MemoryCache::new();
        cache.set("a", 100.0, Duration::from_secs(10)).await.unwrap();
        let gate = Gate::new(&cache);

        let delay = gate.evaluate(&slot("a", 10.0), 100.04).await.unwrap();

        assert!((delay - 0.06).abs() < 1e-9);
        assert_eq!(cache.get("a").await.unwrap(), Some(100.0));
    }

    #[tokio::test]
    async fn test_boundary_around_minimum_interval() {
        let cache = MemoryCache::new();
        let gate = Gate::new(&cache);
        let epsilon = 1e-3;

        cache.set("a", 100.0, Duration::from_secs(10)).await.unwrap();
        let before = gate.evaluate(&slot("a", 4.0), 100.25 - epsilon).await.unwrap();
        assert!(before > 0.0);

        let after = gate.evaluate(&slot("a", 4.0), 100.25 + epsilon).await.unwrap();
        assert_eq!(after, 0.0);
        assert_eq!(cache.get("a").await.unwrap(), Some(100.25 + epsilon));
    }

    #[tokio::test]
    async fn test_multi_claims_all_free_slots() {
        let cache = MemoryCache::new();
        let gate = Gate::new(&cache);
        let slots = vec![slot("a", 10.0), slot("b", 1.0)];

        let delay = gate.evaluate_all(&slots, 50.0).await.unwrap();

        assert_eq!(delay, 0.0);
        assert_eq!(cache.get("a").await.unwrap(), Some(50.0));
        assert_eq!(cache.get("b").await.unwrap(), Some(50.0));
    }

    #[tokio::test]
    async fn test_multi_first_blocking_limit_stops_pass() {
        let cache = MemoryCache::new();
        cache.set("b", 49.5, Duration::from_secs(10)).await.unwrap();
        let gate = Gate::new(&cache);
        let slots = vec![slot("a", 10.0), slot("b", 1.0), slot("c", 1.0)];

        let delay = gate.evaluate_all(&slots, 50.0).await.unwrap();

        assert!((delay - 0.5).abs() < 1e-9);
        // "a" was free and stays claimed, "c" is never reached
        assert_eq!(cache.get("a").await.unwrap(), Some(50.0));
        assert_eq!(cache.get("b").await.unwrap(), Some(49.5));
        assert_eq!(cache.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_multi_duplicate_key_checked_once() {
        let cache = MemoryCache::new();
        let gate = Gate::new(&cache);
        // the 100/s limit shares the key of the 10/s limit and is skipped
        let slots = vec![slot("shared", 10.0), slot("shared", 100.0)];

        assert_eq!(gate.evaluate_all(&slots, 10.0).await.unwrap(), 0.0);

        let delay = gate.evaluate_all(&slots, 10.05).await.unwrap();
        assert!((delay - 0.05).abs() < 1e-9);

        assert_eq!(gate.evaluate_all(&slots, 10.1 + 1e-6).await.unwrap(), 0.0);
    }
}
