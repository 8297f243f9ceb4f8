//! Sliding-window limiter for failed authentication attempts.
//!
//! Only failures are recorded. Once an address has `max_failures` failures
//! inside the window, its connections are refused without a credential
//! lookup until the oldest failure ages out.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Default window for counting failures.
pub const AUTH_FAILURE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct AuthFailureLimiter {
    /// Failures allowed within the window. Zero disables the limiter.
    max_failures: u32,
    window: Duration,
    /// Per-address failure timestamps.
    failures: HashMap<IpAddr, Vec<Instant>>,
}

impl AuthFailureLimiter {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: HashMap::new(),
        }
    }

    /// Record one failed attempt from `ip`.
    pub fn record_failure(&mut self, ip: IpAddr) {
        if self.max_failures == 0 {
            return;
        }
        let now = Instant::now();
        let window = self.window;
        let attempts = self.failures.entry(ip).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);
        attempts.push(now);
    }

    /// Whether `ip` has used up its failures for the current window.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        if self.max_failures == 0 {
            return false;
        }
        let now = Instant::now();
        self.failures.get(&ip).is_some_and(|attempts| {
            let active = attempts
                .iter()
                .filter(|t| now.duration_since(**t) < self.window)
                .count();
            active as u32 >= self.max_failures
        })
    }

    /// Forget failures that have aged out. Returns how many addresses remain tracked.
    pub fn gc(&mut self) -> usize {
        let now = Instant::now();
        let window = self.window;
        self.failures.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
        self.failures.len()
    }
}

impl Default for AuthFailureLimiter {
    fn default() -> Self {
        Self::new(10, AUTH_FAILURE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn blocks_after_max_failures() {
        let mut limiter = AuthFailureLimiter::new(3, AUTH_FAILURE_WINDOW);
        for _ in 0..2 {
            limiter.record_failure(ip(1));
            assert!(!limiter.is_blocked(ip(1)));
        }
        limiter.record_failure(ip(1));
        assert!(limiter.is_blocked(ip(1)));
    }

    #[test]
    fn addresses_are_independent() {
        let mut limiter = AuthFailureLimiter::new(1, AUTH_FAILURE_WINDOW);
        limiter.record_failure(ip(1));
        assert!(limiter.is_blocked(ip(1)));
        assert!(!limiter.is_blocked(ip(2)));
    }

    #[test]
    fn failures_expire_with_the_window() {
        let mut limiter = AuthFailureLimiter::new(1, Duration::from_millis(20));
        limiter.record_failure(ip(1));
        assert!(limiter.is_blocked(ip(1)));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!limiter.is_blocked(ip(1)));
        assert_eq!(limiter.gc(), 0);
    }

    #[test]
    fn zero_disables_limiting() {
        let mut limiter = AuthFailureLimiter::new(0, AUTH_FAILURE_WINDOW);
        for _ in 0..50 {
            limiter.record_failure(ip(1));
        }
        assert!(!limiter.is_blocked(ip(1)));
        assert_eq!(limiter.gc(), 0);
    }

    #[test]
    fn gc_keeps_recent_failures() {
        let mut limiter = AuthFailureLimiter::default();
        limiter.record_failure(ip(1));
        limiter.record_failure(ip(2));
        assert_eq!(limiter.gc(), 2);
    }
}
