use std::time;

use rand::Rng;

#[derive(Copy, Clone, Debug, PartialEq)]
/// Settings for the delay a consumer waits after a failed fetch.
pub struct BackoffConfig {
    /// The first delay after a success, and the value `reset` returns to.
    pub min: time::Duration,
    /// The delay never grows past this.
    pub max: time::Duration,
    /// Multiplier applied to the delay after every failure. Values below 1 are treated as 1.
    pub factor: f64,
    /// Wait a uniformly random fraction of the delay instead of the full delay.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: time::Duration::from_secs(1),
            max: time::Duration::from_secs(30),
            factor: 1.0,
            jitter: true,
        }
    }
}

/// Stateful backoff owned by a single consumer loop.
///
/// The current delay only grows between resets and is capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: time::Duration,
    max: time::Duration,
    factor: f64,
    jitter: bool,
    current: time::Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let max = config.max.max(config.min);
        Self {
            min: config.min,
            max,
            // f64::max ignores NaN, so a NaN factor also ends up as 1.
            factor: config.factor.max(1.0),
            jitter: config.jitter,
            current: config.min,
        }
    }

    /// Delay before the next retry. Grows the following delay by `factor`, up to `max`.
    pub fn next_delay(&mut self) -> time::Duration {
        let delay = if self.jitter {
            self.current.mul_f64(rand::thread_rng().gen::<f64>())
        } else {
            self.current
        };

        let grown = (self.current.as_nanos() as f64 * self.factor).round();
        self.current = if !grown.is_finite() || grown >= self.max.as_nanos() as f64 {
            self.max
        } else {
            time::Duration::from_nanos(grown as u64).max(self.current)
        };

        delay
    }

    /// Go back to the minimum delay, after a successful fetch.
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn current(&self) -> time::Duration {
        self.current
    }
}
