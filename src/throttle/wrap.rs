//! Wrapping async functions in a throttle.

use std::future::Future;
use std::sync::Arc;

use super::limiter::{Permit, Throttle};
use crate::error::Result;

/// An async function guarded by a [`Throttle`].
///
/// `call` takes the same arguments as the wrapped function and returns its
/// output, or the marker when the call was denied with retry disabled.
/// A throttle that was switched off at wrap time is dropped entirely and
/// the function is called directly.
pub struct Throttled<A, F, T> {
    name: String,
    func: F,
    throttle: Option<Arc<Throttle<A>>>,
    marker: T,
}

impl<A, F, Fut, T> Throttled<A, F, T>
where
    F: Fn(A) -> Fut,
    Fut: Future<Output = T>,
    T: Clone,
{
    /// Wrap `func` under `name` with a shared throttle.
    pub fn new(throttle: Arc<Throttle<A>>, name: impl Into<String>, func: F, marker: T) -> Self {
        let throttle = if throttle.is_enabled() {
            Some(throttle)
        } else {
            None
        };

        Self {
            name: name.into(),
            func,
            throttle,
            marker,
        }
    }

    /// Call the wrapped function once the throttle allows it.
    ///
    /// Lock failures and timeouts are returned as errors and the function
    /// is not called.
    pub async fn call(&self, args: A) -> Result<T> {
        let throttle = match &self.throttle {
            Some(throttle) => throttle,
            None => return Ok((self.func)(args).await),
        };

        match throttle.acquire(&self.name, &args).await? {
            Permit::Denied { .. } => Ok(self.marker.clone()),
            Permit::Granted | Permit::Unthrottled => Ok((self.func)(args).await),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether calls go through the throttle at all.
    pub fn is_throttled(&self) -> bool {
        self.throttle.is_some()
    }

    pub fn marker(&self) -> &T {
        &self.marker
    }
}

impl<A> Throttle<A> {
    /// Wrap `func`, returning `T::default()` for denied calls.
    pub fn wrap<F, Fut, T>(self, name: impl Into<String>, func: F) -> Throttled<A, F, T>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = T>,
        T: Clone + Default,
    {
        self.wrap_with_marker(name, func, T::default())
    }

    /// Wrap `func`, returning `marker` for denied calls.
    pub fn wrap_with_marker<F, Fut, T>(
        self,
        name: impl Into<String>,
        func: F,
        marker: T,
    ) -> Throttled<A, F, T>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = T>,
        T: Clone,
    {
        Throttled::new(Arc::new(self), name, func, marker)
    }
}
