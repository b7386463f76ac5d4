//! Retry delay computation.

use std::time::Duration;

use {rand::Rng, switchboard_config::QueueConfig};

/// Exponential backoff with a cap and symmetric jitter.
///
/// The delay after the n-th failed attempt is `base * multiplier^(n-1)`,
/// capped at `max`, then scaled by a random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for BackoffPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier,
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: config.backoff_jitter,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay after `attempt` failures (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base.as_secs_f64() * 1_000.0 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_secs_f64() * 1_000.0);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Jittered delay after `attempt` failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = if self.jitter > 0.0 {
            rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        self.apply_jitter(self.base_delay(attempt), factor)
    }

    fn apply_jitter(&self, delay: Duration, factor: f64) -> Duration {
        Duration::from_millis((delay.as_millis() as f64 * factor).max(0.0) as u64)
    }
}
