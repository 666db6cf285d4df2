//! Local request budget, independent of whatever the remote service enforces.
//!
//! Fixed window: the first request opens a window of `window` length; at most
//! `max_requests` are admitted inside it. Once the window has elapsed the
//! counter drops back to zero and a new window starts.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit of {max_requests} requests exceeded, retry in {}s", .retry_after.as_secs())]
pub struct RateLimited {
    pub max_requests: u32,
    pub retry_after: Duration,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    count: u32,
    window_end: Option<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            count: 0,
            window_end: None,
        }
    }

    /// Admit one request now, or fail without consuming anything.
    pub fn try_acquire(&mut self) -> Result<(), RateLimited> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), RateLimited> {
        self.roll(now);
        let window_end = self.window_end.unwrap_or(now);
        if self.count >= self.max_requests {
            return Err(RateLimited {
                max_requests: self.max_requests,
                retry_after: window_end.saturating_duration_since(now),
            });
        }
        self.count += 1;
        Ok(())
    }

    /// Requests already admitted in the current window.
    pub fn used_at(&mut self, now: Instant) -> u32 {
        self.roll(now);
        self.count
    }

    fn roll(&mut self, now: Instant) {
        match self.window_end {
            Some(end) if now < end => {}
            _ => {
                self.count = 0;
                self.window_end = Some(now + self.window);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_exactly_the_budget_then_refuses() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(limiter.try_acquire_at(t0 + Duration::from_secs(i)).is_ok());
        }
        let err = limiter
            .try_acquire_at(t0 + Duration::from_secs(10))
            .unwrap_err();
        assert_eq!(err.max_requests, 3);
        assert_eq!(err.retry_after, Duration::from_secs(50));
        // A refused request does not consume budget.
        assert_eq!(limiter.used_at(t0 + Duration::from_secs(11)), 3);
    }

    #[test]
    fn counter_resets_once_the_window_elapses() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        limiter.try_acquire_at(t0).unwrap();
        limiter.try_acquire_at(t0).unwrap();
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(59)).is_err());

        let later = t0 + Duration::from_secs(60);
        assert_eq!(limiter.used_at(later), 0);
        assert!(limiter.try_acquire_at(later).is_ok());
        assert_eq!(limiter.used_at(later), 1);
    }

    #[test]
    fn zero_budget_refuses_everything() {
        let mut limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert!(limiter.try_acquire().is_err());
    }
}
