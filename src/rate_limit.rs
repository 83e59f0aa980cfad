use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::limits::{DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW_SECS};

const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    count: u32,
}

/// Fixed-window counter keyed by client address, shared by every request
/// handled in this process.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT, Duration::from_secs(DEFAULT_RATE_WINDOW_SECS))
    }
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one attempt for `key`. Returns false once the window is full.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        if self.windows.len() >= PRUNE_THRESHOLD {
            self.prune_at(now);
        }
        self.allow_at(key, now)
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            opened: now,
            count: 0,
        });
        if now.saturating_duration_since(entry.opened) >= self.window {
            *entry = Window { opened: now, count: 0 };
        }
        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop expired windows so one-off addresses do not accumulate.
    fn prune_at(&self, now: Instant) {
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.opened) < self.window);
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_limit_within_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.allow_at("10.0.0.1", t0));
        assert!(limiter.allow_at("10.0.0.1", t0));
        assert!(limiter.allow_at("10.0.0.1", t0 + Duration::from_secs(10)));
        assert!(!limiter.allow_at("10.0.0.1", t0 + Duration::from_secs(59)));
    }

    #[test]
    fn window_resets() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.allow_at("a", t0));
        assert!(!limiter.allow_at("a", t0 + Duration::from_secs(30)));
        assert!(limiter.allow_at("a", t0 + Duration::from_secs(60)));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.allow_at("a", t0));
        assert!(limiter.allow_at("b", t0));
        assert!(!limiter.allow_at("a", t0));
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn prune_drops_expired_windows() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        limiter.allow_at("old", t0);
        limiter.allow_at("fresh", t0 + Duration::from_secs(90));
        limiter.prune_at(t0 + Duration::from_secs(100));
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn default_policy_is_ten_per_minute() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.limit(), 10);
        for _ in 0..10 {
            assert!(limiter.allow("1.2.3.4"));
        }
        assert!(!limiter.allow("1.2.3.4"));
    }
}
