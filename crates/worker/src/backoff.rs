//! Exponential backoff between retries of a failed unit.

use std::time::Duration;

/// Tunable parameters for the retry delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failed attempt.
    pub multiplier: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
        }
    }
}

impl RetryBackoff {
    pub fn with_initial(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Self::default()
        }
    }

    /// Delay before retrying a unit that has already been attempted
    /// `attempts` times before the failing execution.
    ///
    /// The result is clamped to [`RetryBackoff::max_delay`].
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 0..attempts {
            delay = next_delay(delay, self);
            if delay >= self.max_delay {
                break;
            }
        }
        delay
    }
}

/// Calculate the next delay from the current one, clamped to the maximum.
pub fn next_delay(current: Duration, config: &RetryBackoff) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}
