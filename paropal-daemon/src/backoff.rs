use std::time::Duration;

/// Doubles `current`, capped at `max`. A zero `current` stays zero.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    if current >= max {
        return max;
    }
    current.saturating_mul(2).min(max)
}

/// Exponential retry delay between `min` and `max`.
#[derive(Clone, Copy, Debug)]
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

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_backoff(self.current, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
