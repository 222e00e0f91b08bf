//! Sliding-window order-rate limiter.
//!
//! Replaces the teacher's token-bucket smoothing with an exact sliding
//! window: a deque of accepted-order timestamps per key (symbol or
//! account), trimmed to the configured window on every check. Exactness
//! matters here because the rule is stated as a hard per-window count, not
//! a smoothed rate.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub max_orders: u32,
}

impl RateLimiterConfig {
    pub fn new(window_ms: u64, max_orders: u32) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            max_orders,
        }
    }
}

struct Window {
    timestamps: VecDeque<Instant>,
}

impl Window {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Tracks order counts per key (symbol, or a sentinel for the whole
/// account) inside a sliding time window.
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true and records the attempt if it is within the window
    /// limit for `key`; returns false (without recording) otherwise.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(key.to_string()).or_insert_with(Window::new);
        entry.prune(now, self.config.window);
        if entry.timestamps.len() as u32 >= self.config.max_orders {
            return false;
        }
        entry.timestamps.push_back(now);
        true
    }

    /// Non-mutating peek: would `try_acquire` succeed for `key` right now?
    /// Used to check several keys atomically before committing any of them.
    pub fn would_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(key.to_string()).or_insert_with(Window::new);
        entry.prune(now, self.config.window);
        (entry.timestamps.len() as u32) < self.config.max_orders
    }

    pub fn count_in_window(&self, key: &str) -> u32 {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(key.to_string()).or_insert_with(Window::new);
        entry.prune(now, self.config.window);
        entry.timestamps.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_rejects() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(1000, 3));
        assert!(limiter.try_acquire("BTCUSDT"));
        assert!(limiter.try_acquire("BTCUSDT"));
        assert!(limiter.try_acquire("BTCUSDT"));
        assert!(!limiter.try_acquire("BTCUSDT"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(1000, 1));
        assert!(limiter.try_acquire("BTCUSDT"));
        assert!(limiter.try_acquire("ETHUSDT"));
        assert!(!limiter.try_acquire("BTCUSDT"));
    }

    #[test]
    fn would_acquire_does_not_consume_budget() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(1000, 1));
        assert!(limiter.would_acquire("BTCUSDT"));
        assert!(limiter.would_acquire("BTCUSDT"));
        assert!(limiter.try_acquire("BTCUSDT"));
        assert!(!limiter.would_acquire("BTCUSDT"));
    }

    #[test]
    fn window_expiry_frees_capacity() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(20, 1));
        assert!(limiter.try_acquire("BTCUSDT"));
        assert!(!limiter.try_acquire("BTCUSDT"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire("BTCUSDT"));
    }
}
