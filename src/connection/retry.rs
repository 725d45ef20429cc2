// Bounded exponential backoff for transient network failures

use rand::Rng;
use std::time::Duration;

/// Retry budget shared by the connection manager and the log streamer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Policy without retries, for callers that must not repeat side effects
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);

        if self.jitter > 0.0 && !delay.is_zero() {
            let spread = delay.as_secs_f64() * self.jitter;
            let extra = rand::thread_rng().gen_range(0.0..=spread);
            (delay + Duration::from_secs_f64(extra)).min(self.max_delay)
        } else {
            delay
        }
    }

    /// Whether another attempt is allowed after `retries_so_far` retries
    pub fn allows(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}
