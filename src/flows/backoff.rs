use std::time::Duration;

const MULTIPLIER: f64 = 1.5;

/// Delay schedule for reconcile passes
///
/// Each call to [`ExponentialBackoff::next_delay`] grows the delay by half
/// until it reaches the cap. Resetting returns to the initial delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(MULTIPLIER).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_to_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(750));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1125));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1687) + Duration::from_micros(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
