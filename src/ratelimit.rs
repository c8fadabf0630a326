//! Per-session rate limiting
//!
//! Two limiter flavors, both keyed by an arbitrary string (the session
//! id, or a fixed key for global limits):
//!
//! - [`TokenBucketLimiter`] for address generation: capacity 1, one
//!   token every 300 s, so a session can mint one address per window
//!   but an idempotent regenerate never burns a token.
//! - [`FixedWindowLimiter`] for payment checks and the public price
//!   endpoint: at most N requests per rolling-reset window.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Token bucket state for a single key
#[derive(Debug)]
struct BucketState {
    /// Fractional tokens currently available
    tokens: f64,
    /// When tokens were last accrued
    last_refill: Instant,
}

/// Token bucket limiter keyed by caller
pub struct TokenBucketLimiter {
    capacity: u32,
    /// Time to accrue one token
    per_token: Duration,
    buckets: DashMap<String, BucketState>,
}

impl TokenBucketLimiter {
    /// Create a limiter with the given capacity and refill interval
    pub fn new(capacity: u32, per_token: Duration) -> Self {
        Self {
            capacity,
            per_token,
            buckets: DashMap::new(),
        }
    }

    /// Take a token for `key`, returning false when the bucket is empty
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState {
                tokens: self.capacity as f64,
                last_refill: now,
            });

        let accrued =
            now.duration_since(entry.last_refill).as_secs_f64() / self.per_token.as_secs_f64();
        entry.tokens = (entry.tokens + accrued).min(self.capacity as f64);
        entry.last_refill = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop bucket state not touched within `max_age`
    pub fn prune_idle(&self, max_age: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, state| now.duration_since(state.last_refill) < max_age);
    }
}

/// Fixed window state for a single key
#[derive(Debug)]
struct WindowState {
    /// Request count in current window
    count: u32,
    /// When the window started
    window_start: Instant,
}

/// Fixed window limiter keyed by caller
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, WindowState>,
}

impl FixedWindowLimiter {
    /// Create a limiter allowing `limit` requests per `window`
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    /// Count a request for `key`, returning false once the window is full
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowState {
                count: 0,
                window_start: now,
            });

        // Reset window if expired
        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop window state not touched within `max_age`
    pub fn prune_idle(&self, max_age: Duration) {
        let now = Instant::now();
        self.windows
            .retain(|_, state| now.duration_since(state.window_start) < max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_single_capacity() {
        let limiter = TokenBucketLimiter::new(1, Duration::from_secs(300));
        assert!(limiter.try_acquire("s1"));
        assert!(!limiter.try_acquire("s1"));
        // Other sessions are unaffected
        assert!(limiter.try_acquire("s2"));
    }

    #[test]
    fn test_token_bucket_refills() {
        let limiter = TokenBucketLimiter::new(1, Duration::from_millis(50));
        assert!(limiter.try_acquire("s1"));
        assert!(!limiter.try_acquire("s1"));
        std::thread::sleep(Duration::from_millis(120));
        assert!(limiter.try_acquire("s1"));
    }

    #[test]
    fn test_token_bucket_does_not_overfill() {
        let limiter = TokenBucketLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.try_acquire("s1"));
        std::thread::sleep(Duration::from_millis(150));
        // Long idle accrues at most one token for capacity 1
        assert!(limiter.try_acquire("s1"));
        assert!(!limiter.try_acquire("s1"));
    }

    #[test]
    fn test_fixed_window_resets() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_millis(50));
        assert!(limiter.check("s1"));
        assert!(!limiter.check("s1"));
        std::thread::sleep(Duration::from_millis(120));
        assert!(limiter.check("s1"));
    }

    #[test]
    fn test_fixed_window_isolates_keys() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_secs(10));
        assert!(limiter.check("s1"));
        assert!(limiter.check("s2"));
        assert!(!limiter.check("s1"));
    }

    #[test]
    fn test_prune_idle_drops_stale_keys() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_millis(10));
        limiter.check("s1");
        std::thread::sleep(Duration::from_millis(30));
        limiter.prune_idle(Duration::from_millis(20));
        assert!(limiter.windows.is_empty());
    }
}
