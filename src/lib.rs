//! Gatekeeper - Distributed Call Throttling
//!
//! This crate rate-limits arbitrary async calls across processes. All
//! processes share a cache/lock backend holding the last permitted call
//! time of every bucket; a named lock makes the check-then-claim step
//! atomic, and callers either wait for a free slot or are turned away.

pub mod cache;
pub mod config;
pub mod error;
pub mod throttle;

pub use cache::{CacheBackend, LockArgs, LockGuard, MemoryCache};
pub use config::ThrottleSettings;
pub use error::{CacheError, LockError, Result, ThrottleError};
pub use throttle::{KeyResolver, Permit, Throttle, ThrottleBuilder, Throttled};
