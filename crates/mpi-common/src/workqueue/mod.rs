//! Rate-limited work queue feeding controller workers
//!
//! Failed items are retried after the larger of a per-item exponential
//! backoff and a shared token-bucket delay.

mod queue;
mod rate_limiter;

use std::hash::Hash;
use std::time::Duration;

pub use queue::WorkQueue;
pub use rate_limiter::{
    exponential_delay, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter, TokenBucket,
};

use crate::Error;

/// Default first retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Default retry delay ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
/// Default overall retry rate
pub const DEFAULT_QUEUE_QPS: f64 = 10.0;
/// Default overall retry burst
pub const DEFAULT_QUEUE_BURST: u32 = 100;

/// Queue retry policy
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimiterSpec {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for the per-item delay
    pub max_delay: Duration,
    /// Token bucket refill rate (retries per second)
    pub qps: f64,
    /// Token bucket size
    pub burst: u32,
}

impl Default for RateLimiterSpec {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QUEUE_QPS,
            burst: DEFAULT_QUEUE_BURST,
        }
    }
}

impl RateLimiterSpec {
    /// Defaults with the given token bucket settings
    pub fn with_bucket(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst,
            ..Default::default()
        }
    }

    /// Reject settings that would stall or never throttle the queue
    pub fn validate(&self) -> Result<(), Error> {
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Err(Error::config(format!(
                "controller queue rate limit must be positive, got {}",
                self.qps
            )));
        }
        if self.burst == 0 {
            return Err(Error::config("controller queue burst must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::config(format!(
                "queue base delay ({:?}) exceeds max delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Per-item exponential backoff combined with the shared token bucket
pub fn default_controller_rate_limiter<K>(spec: &RateLimiterSpec) -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            spec.base_delay,
            spec.max_delay,
        )),
        Box::new(BucketRateLimiter::new(spec.qps, spec.burst)),
    ])
}

/// Build a work queue using the controller rate limiter for `spec`
pub fn controller_queue<K>(spec: &RateLimiterSpec) -> Result<WorkQueue<K>, Error>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    spec.validate()?;
    Ok(WorkQueue::new(Box::new(default_controller_rate_limiter(
        spec,
    ))))
}
