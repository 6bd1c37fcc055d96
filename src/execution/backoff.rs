//! Retry backoff

use std::time::Duration;

use crate::core::config::DispatcherConfig;

/// Exponential backoff with proportional jitter.
///
/// Delay for attempt `n` (1-based) is `base * multiplier^(n-1)`, capped at
/// `max`, then spread by +/- `jitter` of itself.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

impl From<&DispatcherConfig> for BackoffPolicy {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl BackoffPolicy {
    /// Deterministic part of the delay after `attempt` failed
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before the next attempt, jittered
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        // uniform in [-jitter, +jitter]
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        nominal.mul_f64((1.0 + spread).max(0.0))
    }

    /// Delay honoring an exchange hint when it is longer than our own
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let own = self.delay(attempt);
        match hint {
            Some(hint) if hint > own => hint,
            _ => own,
        }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
