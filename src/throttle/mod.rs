//! Distributed call throttling.
//!
//! A [`Throttle`] holds one or more rate limits. For every call it resolves
//! a bucket key per limit, then repeatedly takes the shared lock, checks the
//! last permitted time of each bucket and either claims the slots or sleeps
//! until they free up. Processes sharing a cache backend share the buckets.

mod clock;
mod gate;
mod key;
mod limiter;
mod observer;
mod rate;
mod wrap;

pub use clock::{Clock, SystemClock};
pub use gate::{Gate, Slot, LOCK_NAME};
pub use key::{KeyResolver, NameKey, StaticKey, STATIC_KEY};
pub use limiter::{Permit, Throttle, ThrottleBuilder};
pub use observer::{log_message, NoopObserver, ThrottleObserver, TracingObserver};
pub use rate::{Limits, RateLimit};
pub use wrap::Throttled;
