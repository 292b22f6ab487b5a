//! Exponential backoff with additive jitter for reconnection attempts.
//!
//! [`BackoffPolicy::next_delay`] is a pure function of the attempt count and
//! the supplied random source: `min(max, base * growth^n)` plus a jitter drawn
//! uniformly from `[0, 0.5 * computed]`. Callers own the attempt counter.

use std::time::Duration;

use rand::Rng;

/// Upper bound of the jitter, as a fraction of the computed delay.
pub const MAX_JITTER_FRACTION: f64 = 0.5;

/// Configuration for retry delays.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for attempt 0. Default: 1 s.
    pub base_delay: Duration,
    /// Multiplier applied per attempt. Default: 2.0.
    pub growth_factor: f64,
    /// Cap on the computed delay, before jitter. Default: 30 s.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            growth_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// The capped exponential delay for `attempt`, without jitter.
    pub fn computed_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.growth_factor.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        if secs.is_finite() && secs < max_secs {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Delay before retry number `attempt`, including jitter drawn from `rng`.
    pub fn next_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let computed = self.computed_delay(attempt);
        let fraction = rng.random_range(0.0..=MAX_JITTER_FRACTION);
        computed + computed.mul_f64(fraction)
    }
}
