//! Exponential backoff for reconnection

use std::time::Duration;

use vg_core::config::BackoffConfig;

/// Exponential backoff with optional jitter.
///
/// With the default configuration the delays are 2s, 4s, 8s, 16s and then
/// 30s for every further attempt.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay handed out by the next call to `next_delay`
    current: Duration,
    /// First delay, restored by `reset`
    initial: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
    /// Delays handed out since the last reset
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            current: std::cmp::min(initial, max),
            initial,
            max,
            multiplier,
            jitter,
            attempts: 0,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts += 1;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        if self.jitter > 0.0 {
            let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
            delay + Duration::from_secs_f64(jitter_amount)
        } else {
            delay
        }
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Restart the sequence at the initial delay
    pub fn reset(&mut self) {
        self.current = std::cmp::min(self.initial, self.max);
        self.attempts = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
