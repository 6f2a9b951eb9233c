//! Error types for Gatekeeper.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a lock handle, either while acquiring or releasing it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockError {
    /// The lock could not be acquired within its blocking timeout.
    #[error("Unable to acquire lock {name:?} within {waited:?}")]
    Acquire { name: String, waited: Duration },

    /// The lock expired or was taken over before it was released.
    #[error("Cannot release lock {name:?} that is no longer owned")]
    NotOwned { name: String },

    /// The backend failed while talking to the lock service.
    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Errors raised by the cache backend on `get`/`set`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// A stored bucket record could not be read as a timestamp.
    #[error("Invalid value stored under {key:?}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Main error type for throttled calls.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Invalid limits, resolvers or settings, raised when building a throttle.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock contention or lost lock ownership. Never retried.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// The deadline elapsed while the call was still being denied a slot.
    #[error("\"{keys}\" throttle timeout after {} seconds", .elapsed.as_secs_f64())]
    Timeout { keys: String, elapsed: Duration },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThrottleError {
    /// Whether this error is the throttle deadline firing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ThrottleError::Timeout { .. })
    }

    /// Whether this error came from the lock primitive.
    pub fn is_lock(&self) -> bool {
        matches!(self, ThrottleError::Lock(_))
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
