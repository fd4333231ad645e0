//! Restart rate limiting
//!
//! A participant may ask for its session to be restarted (explicitly, or
//! implicitly via an ICE failure). Restarts are expensive — they burn a
//! bridge allocation and a full renegotiation — so each participant gets a
//! sliding-window budget.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::RestartLimitConfig;

/// Sliding-window limiter: at most `max_requests` accepted requests per
/// `window`, never two closer than `min_interval` apart.
#[derive(Debug)]
pub struct RestartRateLimiter {
    min_interval: Duration,
    max_requests: usize,
    window: Duration,
    accepted: VecDeque<Instant>,
}

impl RestartRateLimiter {
    pub fn new(config: &RestartLimitConfig) -> Self {
        Self {
            min_interval: config.min_interval,
            max_requests: config.max_requests,
            window: config.window,
            accepted: VecDeque::new(),
        }
    }

    /// Whether a restart request arriving now is accepted. Accepted
    /// requests consume budget; rejected ones do not.
    pub fn accept(&mut self) -> bool {
        self.accept_at(Instant::now())
    }

    fn accept_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.accepted.front() {
            if now.duration_since(*front) > self.window {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
        if let Some(last) = self.accepted.back() {
            if now.duration_since(*last) < self.min_interval {
                return false;
            }
        }
        if self.accepted.len() >= self.max_requests {
            return false;
        }
        self.accepted.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(min_interval: u64, max_requests: usize, window: u64) -> RestartRateLimiter {
        RestartRateLimiter::new(&RestartLimitConfig {
            min_interval: Duration::from_secs(min_interval),
            max_requests,
            window: Duration::from_secs(window),
        })
    }

    #[test]
    fn enforces_min_interval() {
        let mut limiter = limiter(10, 5, 60);
        let start = Instant::now();
        assert!(limiter.accept_at(start));
        assert!(!limiter.accept_at(start + Duration::from_secs(5)));
        assert!(limiter.accept_at(start + Duration::from_secs(10)));
    }

    #[test]
    fn enforces_window_budget() {
        let mut limiter = limiter(0, 2, 60);
        let start = Instant::now();
        assert!(limiter.accept_at(start));
        assert!(limiter.accept_at(start + Duration::from_secs(1)));
        assert!(!limiter.accept_at(start + Duration::from_secs(2)));
        // Budget frees up once the first accept leaves the window.
        assert!(limiter.accept_at(start + Duration::from_secs(62)));
    }

    #[test]
    fn rejections_consume_no_budget() {
        let mut limiter = limiter(10, 2, 60);
        let start = Instant::now();
        assert!(limiter.accept_at(start));
        assert!(!limiter.accept_at(start + Duration::from_secs(1)));
        assert!(!limiter.accept_at(start + Duration::from_secs(2)));
        assert!(limiter.accept_at(start + Duration::from_secs(10)));
    }
}
