use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry schedule as plain data. Whoever drives the retries decides how to
/// wait; this type only answers "how many tries" and "how long before the next one".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied per retry. 1.0 gives a fixed backoff.
    pub multiplier: f64,
    /// Random spread as a ratio of the computed delay, in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// True when another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Delay to wait after the failed `attempt` (1-based) before the next one.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.base_delay.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_delay.max(self.base_delay).as_nanos() as f64);
        let spread = if self.jitter > 0.0 {
            let ratio = self.jitter.min(1.0);
            rng.gen_range(-ratio..=ratio)
        } else {
            0.0
        };
        Duration::from_nanos((capped * (1.0 + spread)).max(0.0).round() as u64)
    }
}
