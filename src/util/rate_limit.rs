use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Lets an expensive action through at most once per `interval`.
pub struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true (and restarts the interval) when the action may run now.
    ///
    /// The first call always passes.
    pub fn try_acquire(&self) -> bool {
        let mut last = self.last.lock();
        let due = match *last {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        };
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// Restarts the interval without checking it.
    pub fn mark(&self) {
        *self.last.lock() = Some(Instant::now());
    }

    /// Time since the action last ran, `None` if it never did.
    pub fn elapsed(&self) -> Option<Duration> {
        self.last.lock().map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_blocks_within_interval() {
        let limiter = RateLimiter::new(Duration::from_secs(3600));
        assert!(limiter.elapsed().is_none());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(limiter.elapsed().is_some());
    }

    #[test]
    fn test_rate_limiter_zero_interval_always_passes() {
        let limiter = RateLimiter::new(Duration::ZERO);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
    }
}
