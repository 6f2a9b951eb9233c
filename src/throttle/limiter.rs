//! The throttle: limits, retry loop and lock protocol.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::gate::{Gate, Slot, LOCK_NAME};
use super::key::KeyResolver;
use super::observer::{NoopObserver, ThrottleObserver, TracingObserver};
use super::rate::{normalize, Keys, Limits, RateLimit};
use crate::cache::{CacheBackend, LockArgs, MemoryCache};
use crate::config::ThrottleSettings;
use crate::error::{Result, ThrottleError};

/// Outcome of asking a throttle for a slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Permit {
    /// No limit applied to the call.
    Unthrottled,
    /// Every applicable bucket was free and has been claimed.
    Granted,
    /// Retrying is disabled and a bucket needed `delay` more time.
    Denied { delay: Duration },
}

impl Permit {
    /// Whether the call may go ahead.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Permit::Denied { .. })
    }
}

/// A distributed throttle over one or more rate limits.
///
/// Every process sharing the same backend shares the same buckets. A
/// throttle is immutable once built and can be shared across tasks.
pub struct Throttle<A = ()> {
    limits: Vec<RateLimit<A>>,
    multi: bool,
    cache: Arc<dyn CacheBackend>,
    retry: bool,
    timeout: Duration,
    lock_args: LockArgs,
    observer: Arc<dyn ThrottleObserver>,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

impl<A> Throttle<A> {
    /// Start building a throttle for one rate or an ordered list of rates.
    pub fn builder(limits: impl Into<Limits>) -> ThrottleBuilder<A> {
        ThrottleBuilder::new(limits)
    }

    pub fn limits(&self) -> &[RateLimit<A>] {
        &self.limits
    }

    /// Whether the throttle was built from a list of limits.
    pub fn is_multi(&self) -> bool {
        self.multi
    }

    /// How long a call may wait for a slot before failing.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn lock_args(&self) -> LockArgs {
        self.lock_args
    }

    pub fn retries(&self) -> bool {
        self.retry
    }

    /// False when throttling was switched off in the settings.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Wait for a slot for the call `name(args)`.
    ///
    /// Resolves every limit's key; limits without a key are skipped and a
    /// call with no keys at all is not throttled. Otherwise the gate is
    /// re-tried under the lock until it grants a slot, the timeout elapses,
    /// or (with retry disabled) it is denied once.
    pub async fn acquire(&self, name: &str, args: &A) -> Result<Permit> {
        if !self.enabled {
            return Ok(Permit::Unthrottled);
        }

        let slots = self.resolve(name, args);
        if slots.is_empty() {
            trace!(call = %name, "No bucket key, skipping throttle");
            return Ok(Permit::Unthrottled);
        }

        let label = self.label(&slots);
        let start = self.clock.now();

        loop {
            let delay = self.attempt(&slots, &label, start).await?;
            if delay <= 0.0 {
                trace!(keys = %label, "Throttle slot granted");
                return Ok(Permit::Granted);
            }

            let delay = Duration::try_from_secs_f64(delay).unwrap_or(self.timeout);
            if !self.retry {
                debug!(keys = %label, delay = ?delay, "Throttle slot denied");
                return Ok(Permit::Denied { delay });
            }

            self.observer.on_retry(&label, delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `call` once a slot for `name(args)` is available.
    ///
    /// Returns `None` without polling `call` when retry is disabled and the
    /// call was denied.
    pub async fn run<F, T>(&self, name: &str, args: &A, call: F) -> Result<Option<T>>
    where
        F: Future<Output = T>,
    {
        match self.acquire(name, args).await? {
            Permit::Denied { .. } => Ok(None),
            Permit::Granted | Permit::Unthrottled => Ok(Some(call.await)),
        }
    }

    fn resolve(&self, name: &str, args: &A) -> Vec<Slot> {
        self.limits
            .iter()
            .filter_map(|limit| {
                limit
                    .resolve(name, args)
                    .map(|key| Slot::new(key, limit.minimum_interval(), limit.expiry()))
            })
            .collect()
    }

    fn label(&self, slots: &[Slot]) -> String {
        if self.multi {
            let keys: Vec<String> = slots.iter().map(|slot| format!("'{}'", slot.key)).collect();
            format!("[{}]", keys.join(", "))
        } else {
            slots[0].key.clone()
        }
    }

    /// One locked pass: acquire the lock, check the deadline, run the gate,
    /// release the lock. A failed release takes precedence over the pass
    /// result. If the pass is cancelled or panics, dropping the guard frees
    /// the lock.
    async fn attempt(&self, slots: &[Slot], label: &str, start: f64) -> Result<f64> {
        let guard = self.cache.lock(LOCK_NAME, &self.lock_args).await?;
        let outcome = self.check_and_claim(slots, label, start).await;
        guard.release().await?;
        outcome
    }

    async fn check_and_claim(&self, slots: &[Slot], label: &str, start: f64) -> Result<f64> {
        let now = self.clock.now();
        let elapsed = now - start;
        if elapsed > self.timeout.as_secs_f64() {
            let elapsed = Duration::try_from_secs_f64(elapsed).unwrap_or(self.timeout);
            self.observer.on_timeout(label, elapsed);
            return Err(ThrottleError::Timeout {
                keys: label.to_string(),
                elapsed,
            });
        }

        let gate = Gate::new(self.cache.as_ref());
        let delay = if self.multi {
            gate.evaluate_all(slots, now).await?
        } else {
            gate.evaluate(&slots[0], now).await?
        };
        Ok(delay)
    }
}

impl<A> fmt::Debug for Throttle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("limits", &self.limits)
            .field("multi", &self.multi)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("lock_args", &self.lock_args)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Throttle`].
pub struct ThrottleBuilder<A = ()> {
    limits: Limits,
    keys: Keys<A>,
    cache: Option<Arc<dyn CacheBackend>>,
    retry: bool,
    timeout: Option<Duration>,
    expiry: Option<Duration>,
    lock_args: Option<LockArgs>,
    observer: Option<Arc<dyn ThrottleObserver>>,
    clock: Option<Arc<dyn Clock>>,
    settings: ThrottleSettings,
}

impl<A> ThrottleBuilder<A> {
    pub fn new(limits: impl Into<Limits>) -> Self {
        Self {
            limits: limits.into(),
            keys: Keys::Default,
            cache: None,
            retry: true,
            timeout: None,
            expiry: None,
            lock_args: None,
            observer: None,
            clock: None,
            settings: ThrottleSettings::default(),
        }
    }

    /// Bucket key resolver. With several limits it applies to the first
    /// one only; the rest use the static key.
    pub fn key(mut self, key: impl KeyResolver<A> + 'static) -> Self {
        self.keys = Keys::Single(Arc::new(key));
        self
    }

    /// One resolver per limit, in order. Missing trailing resolvers default
    /// to the static key; more resolvers than limits is an error.
    pub fn keys(mut self, keys: Vec<Arc<dyn KeyResolver<A>>>) -> Self {
        self.keys = Keys::List(keys);
        self
    }

    /// Shared backend. Defaults to a fresh process-local [`MemoryCache`].
    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Retry denied calls until the timeout (default) or give up at once.
    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the TTL of bucket records for every limit.
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Override the arguments passed to the backend's lock call.
    pub fn lock_args(mut self, lock_args: LockArgs) -> Self {
        self.lock_args = Some(lock_args);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ThrottleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Apply process-wide settings: the on/off switch, logging and lock
    /// defaults. Explicit builder options take precedence.
    pub fn settings(mut self, settings: ThrottleSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Throttle<A>> {
        let normalized = normalize(self.limits, self.keys, self.timeout, self.expiry)?;

        let lock_args = match self.lock_args {
            Some(lock_args) => lock_args,
            None => self.settings.lock.to_lock_args(normalized.timeout)?,
        };

        let observer: Arc<dyn ThrottleObserver> = match self.observer {
            Some(observer) => observer,
            None if self.settings.logging => {
                Arc::new(TracingObserver::new(&self.settings.log_prefix))
            }
            None => Arc::new(NoopObserver),
        };
        let cache: Arc<dyn CacheBackend> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(MemoryCache::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        debug!(
            limits = normalized.limits.len(),
            multi = normalized.multi,
            timeout = ?normalized.timeout,
            retry = self.retry,
            enabled = self.settings.enabled,
            "Built throttle"
        );

        Ok(Throttle {
            limits: normalized.limits,
            multi: normalized.multi,
            cache,
            retry: self.retry,
            timeout: normalized.timeout,
            lock_args,
            observer,
            clock,
            enabled: self.settings.enabled,
        })
    }
}
