//! Rate limit normalization.
//!
//! Turns caller-supplied rates (calls per second) and key resolvers into
//! `RateLimit`s carrying the minimum interval between calls and the TTL of
//! the bucket records they write.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::key::{KeyResolver, StaticKey};
use crate::error::{Result, ThrottleError};

/// Floor for the default throttle timeout, in seconds.
const MIN_DEFAULT_TIMEOUT_SECS: f64 = 10.0;
/// Default timeout and expiry are this many minimum intervals.
const INTERVAL_MULTIPLIER: f64 = 10.0;

/// One rate or an ordered list of rates, in calls per second.
#[derive(Debug, Clone, PartialEq)]
pub enum Limits {
    Single(f64),
    Multi(Vec<f64>),
}

impl From<f64> for Limits {
    fn from(rate: f64) -> Self {
        Limits::Single(rate)
    }
}

impl From<Vec<f64>> for Limits {
    fn from(rates: Vec<f64>) -> Self {
        Limits::Multi(rates)
    }
}

impl From<&[f64]> for Limits {
    fn from(rates: &[f64]) -> Self {
        Limits::Multi(rates.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for Limits {
    fn from(rates: [f64; N]) -> Self {
        Limits::Multi(rates.to_vec())
    }
}

/// Key resolvers supplied alongside the limits.
pub(crate) enum Keys<A> {
    Default,
    Single(Arc<dyn KeyResolver<A>>),
    List(Vec<Arc<dyn KeyResolver<A>>>),
}

/// A normalized rate limit.
pub struct RateLimit<A> {
    minimum_interval: f64,
    key: Arc<dyn KeyResolver<A>>,
    expiry: Duration,
}

impl<A> RateLimit<A> {
    /// Minimum seconds between two permitted calls into one bucket.
    pub fn minimum_interval(&self) -> f64 {
        self.minimum_interval
    }

    /// TTL of the bucket records written for this limit.
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Resolve the bucket key of a call against this limit.
    pub fn resolve(&self, name: &str, args: &A) -> Option<String> {
        self.key.resolve(name, args)
    }
}

impl<A> fmt::Debug for RateLimit<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimit")
            .field("minimum_interval", &self.minimum_interval)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

/// The outcome of normalizing a limit configuration.
pub(crate) struct Normalized<A> {
    pub limits: Vec<RateLimit<A>>,
    pub multi: bool,
    pub timeout: Duration,
}

/// Validate and normalize limits, resolvers, timeout and expiry.
///
/// A zero `timeout` counts as not given. An explicit `expiry` applies to
/// every limit and may not be shorter than the default it replaces.
pub(crate) fn normalize<A>(
    limits: Limits,
    keys: Keys<A>,
    timeout: Option<Duration>,
    expiry: Option<Duration>,
) -> Result<Normalized<A>> {
    let (rates, multi) = match limits {
        Limits::Single(rate) => (vec![rate], false),
        Limits::Multi(rates) => (rates, true),
    };

    if rates.is_empty() {
        return Err(ThrottleError::Config(
            "At least one rate limit is required".to_string(),
        ));
    }

    let mut keys = match keys {
        Keys::Default => Vec::new(),
        Keys::Single(key) => vec![key],
        Keys::List(keys) => keys,
    };
    if keys.len() > rates.len() {
        return Err(ThrottleError::Config(format!(
            "{} key resolvers supplied for {} rate limits",
            keys.len(),
            rates.len()
        )));
    }

    let intervals = rates
        .iter()
        .map(|&rate| minimum_interval(rate))
        .collect::<Result<Vec<f64>>>()?;
    let slowest = intervals.iter().copied().fold(0.0_f64, f64::max);

    let timeout = match timeout {
        Some(timeout) if !timeout.is_zero() => timeout,
        _ => to_duration(
            "timeout",
            MIN_DEFAULT_TIMEOUT_SECS.max(INTERVAL_MULTIPLIER * slowest),
        )?,
    };

    let static_key: Arc<dyn KeyResolver<A>> = Arc::new(StaticKey::default());
    keys.resize_with(rates.len(), || static_key.clone());

    let limits = intervals
        .into_iter()
        .zip(keys)
        .map(|(minimum_interval, key)| -> Result<RateLimit<A>> {
            let floor = to_duration("expiry", INTERVAL_MULTIPLIER * minimum_interval)?.max(timeout);
            let expiry = match expiry {
                Some(expiry) if expiry < floor => {
                    return Err(ThrottleError::Config(format!(
                        "Expiry {:?} is shorter than the minimum of {:?} for a {} second interval",
                        expiry, floor, minimum_interval
                    )))
                }
                Some(expiry) => expiry,
                None => floor,
            };
            Ok(RateLimit {
                minimum_interval,
                key,
                expiry,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Normalized {
        limits,
        multi,
        timeout,
    })
}

fn minimum_interval(rate: f64) -> Result<f64> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(ThrottleError::Config(format!(
            "Rate must be a positive number of calls per second, got {}",
            rate
        )));
    }

    let interval = 1.0 / rate;
    if !interval.is_finite() {
        return Err(ThrottleError::Config(format!("Rate {} is too small", rate)));
    }
    Ok(interval)
}

fn to_duration(field: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ThrottleError::Config(format!("Invalid {} of {} seconds: {}", field, secs, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_arg() -> Arc<dyn KeyResolver<u32>> {
        Arc::new(|_: &str, n: &u32| Some(format!("n:{}", n)))
    }

    #[test]
    fn test_single_limit_defaults() {
        let normalized = normalize::<u32>(Limits::from(10.0), Keys::Default, None, None).unwrap();

        assert!(!normalized.multi);
        assert_eq!(normalized.timeout, Duration::from_secs(10));
        assert_eq!(normalized.limits.len(), 1);

        let limit = &normalized.limits[0];
        assert!((limit.minimum_interval() - 0.1).abs() < 1e-12);
        assert_eq!(limit.expiry(), Duration::from_secs(10));
        assert_eq!(limit.resolve("f", &1), Some("throttle:static".to_string()));
    }

    #[test]
    fn test_slow_rate_raises_default_timeout() {
        let normalized =
            normalize::<u32>(Limits::from(vec![0.5, 0.05]), Keys::Default, None, None).unwrap();

        // slowest interval is 20s, so the timeout is 200s
        assert_eq!(normalized.timeout, Duration::from_secs(200));
        assert_eq!(normalized.limits[0].expiry(), Duration::from_secs(200));
        assert_eq!(normalized.limits[1].expiry(), Duration::from_secs(200));
    }

    #[test]
    fn test_explicit_timeout_bounds_expiry() {
        let normalized = normalize::<u32>(
            Limits::from(vec![0.1, 100.0]),
            Keys::Default,
            Some(Duration::from_secs(30)),
            None,
        )
        .unwrap();

        assert_eq!(normalized.timeout, Duration::from_secs(30));
        assert_eq!(normalized.limits[0].expiry(), Duration::from_secs(100));
        assert_eq!(normalized.limits[1].expiry(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_timeout_uses_default() {
        let normalized =
            normalize::<u32>(Limits::from(10.0), Keys::Default, Some(Duration::ZERO), None)
                .unwrap();
        assert_eq!(normalized.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_non_positive_rates() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = normalize::<u32>(Limits::from(rate), Keys::Default, None, None);
            assert!(matches!(result, Err(ThrottleError::Config(_))), "rate {}", rate);
        }
    }

    #[test]
    fn test_rejects_empty_limit_list() {
        let result = normalize::<u32>(Limits::from(Vec::<f64>::new()), Keys::Default, None, None);
        assert!(matches!(result, Err(ThrottleError::Config(_))));
    }

    #[test]
    fn test_rejects_more_keys_than_limits() {
        let result = normalize(
            Limits::from(vec![10.0]),
            Keys::List(vec![per_arg(), per_arg()]),
            None,
            None,
        );
        assert!(matches!(result, Err(ThrottleError::Config(_))));
    }

    #[test]
    fn test_single_key_applies_to_first_limit_only() {
        let normalized = normalize(
            Limits::from(vec![10.0, 1.0]),
            Keys::Single(per_arg()),
            None,
            None,
        )
        .unwrap();

        assert!(normalized.multi);
        assert_eq!(normalized.limits[0].resolve("f", &3), Some("n:3".to_string()));
        assert_eq!(
            normalized.limits[1].resolve("f", &3),
            Some("throttle:static".to_string())
        );
    }

    #[test]
    fn test_explicit_expiry() {
        let normalized = normalize::<u32>(
            Limits::from(10.0),
            Keys::Default,
            None,
            Some(Duration::from_secs(60)),
        )
        .unwrap();
        assert_eq!(normalized.limits[0].expiry(), Duration::from_secs(60));

        let too_short = normalize::<u32>(
            Limits::from(10.0),
            Keys::Default,
            None,
            Some(Duration::from_secs(1)),
        );
        assert!(matches!(too_short, Err(ThrottleError::Config(_))));
    }

    #[test]
    fn test_order_is_preserved() {
        let normalized =
            normalize::<u32>(Limits::from([1.0, 4.0, 2.0]), Keys::Default, None, None).unwrap();
        let intervals: Vec<f64> = normalized
            .limits
            .iter()
            .map(|l| l.minimum_interval())
            .collect();
        assert_eq!(intervals, vec![1.0, 0.25, 0.5]);
    }
}
