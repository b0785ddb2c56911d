//! Requeue delay policies
//!
//! A rate limiter answers "how long until this item may be retried".
//! Per-item exponential backoff protects the API server from one
//! hot-failing job; the shared token bucket caps the overall retry rate.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Delay policy for requeued items
pub trait RateLimiter<K>: Send + Sync {
    /// Wait before `item` may be processed again; counts as one requeue
    fn when(&self, item: &K) -> Duration;

    /// Stop tracking `item` (it succeeded)
    fn forget(&self, item: &K);

    /// Requeues recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &K) -> u32;
}

/// `base * 2^k` capped at `max`, where `k` counts the item's prior failures
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    /// Create a limiter backing off from `base_delay` up to `max_delay`
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

/// `base * 2^exp`, saturating to `max`
pub fn exponential_delay(base: Duration, max: Duration, exp: u32) -> Duration {
    let factor = 2f64.powi(exp.min(i32::MAX as u32) as i32);
    let delay = base.as_secs_f64() * factor;
    if !delay.is_finite() || delay >= max.as_secs_f64() {
        return max;
    }
    Duration::try_from_secs_f64(delay).map_or(max, |d| d.min(max))
}

impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Eq + Hash + Clone + Send,
{
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        exponential_delay(self.base_delay, self.max_delay, exp)
    }

    fn forget(&self, item: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

/// Token bucket with reservation semantics
///
/// Every reservation takes a token, even when none is available; the
/// balance goes negative and the caller waits until it would have
/// refilled. Reservations are therefore served in order at `rate`.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Create a full bucket refilling at `rate` tokens/s up to `burst`
    pub fn new(rate: f64, burst: u32, now: Instant) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last: now,
        }
    }

    /// Reserve one token at `now`, returning how long to wait for it
    pub fn reserve_at(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if now > self.last {
            self.last = now;
        }
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            return Duration::ZERO;
        }
        if self.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(-self.tokens / self.rate).unwrap_or(Duration::MAX)
    }
}

/// Overall retry rate limit shared by all items
#[derive(Debug)]
pub struct BucketRateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl BucketRateLimiter {
    /// Create a limiter allowing `qps` retries/s with bursts of `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(qps, burst, Instant::now())),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        self.bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve_at(Instant::now())
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Longest delay of all member limiters
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Combine `limiters`; every member sees every call
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}
