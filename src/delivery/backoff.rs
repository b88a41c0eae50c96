use crate::config::RetryConfig;
use std::time::Duration;

/// Exponential backoff with bounded jitter.
///
/// `delay_with_sample` is deterministic for a given jitter sample so retry
/// schedules can be asserted exactly; `delay` draws the sample from `rand`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms as f64,
            max_ms: config.max_delay_ms as f64,
            multiplier: config.multiplier,
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Delay before the retry that follows failure number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_sample(attempt, rand::random::<f64>())
    }

    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_ms * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_ms);
        let jitter = capped * self.jitter_ratio * sample.clamp(0.0, 1.0);
        let total_ms = (capped + jitter).min(self.max_ms).max(self.base_ms);
        Duration::from_micros((total_ms * 1000.0).round() as u64)
    }
}
