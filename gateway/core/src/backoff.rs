//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Returns the next delay, between half and one-and-a-half times the current
    /// step, and doubles the step up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);
        self.current = (self.current * 2).min(self.max);
        delay.min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
