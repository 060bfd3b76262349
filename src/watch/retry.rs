//! Reconnection backoff policy.

use std::time::Duration;

use rand::Rng;

use crate::config::WatchConfig;

/// Bounded exponential backoff with symmetric jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before the entry goes Errored.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for RetryPolicy {
    fn from(config: &WatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Deterministic policy with no jitter, mostly for tests.
    #[must_use]
    pub fn fixed(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Whether `failures` consecutive failures exhaust the policy.
    #[must_use]
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_retries
    }

    /// Un-jittered delay after the `failure`-th consecutive failure (1-based).
    #[must_use]
    pub fn base_delay(&self, failure: u32) -> Duration {
        let exponent = i32::try_from(failure.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Delay to sleep after the `failure`-th consecutive failure.
    #[must_use]
    pub fn delay_for(&self, failure: u32) -> Duration {
        let base = self.base_delay(failure);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}
