//! Hooks for observing throttled calls.

use std::time::Duration;

use tracing::{info, warn};

/// Receives notifications about waits and timeouts.
///
/// `keys` is the resolved bucket key of a single-limit throttle, or the
/// list of keys of a multi-limit one.
pub trait ThrottleObserver: Send + Sync {
    /// A call was denied and will be retried after `delay`.
    fn on_retry(&self, _keys: &str, _delay: Duration) {}

    /// A call gave up after `elapsed` without getting a slot.
    fn on_timeout(&self, _keys: &str, _elapsed: Duration) {}

    /// Name of the logger the observer writes to, if it logs at all.
    fn logger(&self) -> Option<&str> {
        None
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ThrottleObserver for NoopObserver {}

/// Observer writing one log line per event through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver {
    logger: String,
}

impl TracingObserver {
    /// Create an observer whose lines carry `<prefix>gatekeeper.throttle`
    /// as their logger name.
    pub fn new(prefix: &str) -> Self {
        Self {
            logger: format!("{}gatekeeper.throttle", prefix),
        }
    }
}

impl ThrottleObserver for TracingObserver {
    fn on_retry(&self, keys: &str, delay: Duration) {
        info!(
            logger = %self.logger,
            keys = %keys,
            delay_secs = delay.as_secs_f64(),
            "{}",
            log_message(keys, "retry in", delay)
        );
    }

    fn on_timeout(&self, keys: &str, elapsed: Duration) {
        warn!(
            logger = %self.logger,
            keys = %keys,
            elapsed_secs = elapsed.as_secs_f64(),
            "{}",
            log_message(keys, "timeout after", elapsed)
        );
    }

    fn logger(&self) -> Option<&str> {
        Some(&self.logger)
    }
}

/// Format a throttle log line, e.g. `"api" throttle retry in 0.1 seconds`.
pub fn log_message(keys: &str, action: &str, duration: Duration) -> String {
    format!(
        "\"{}\" throttle {} {} seconds",
        keys,
        action,
        duration.as_secs_f64()
    )
}
