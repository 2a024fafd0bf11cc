//! Sliding-window rate limiting keyed by sender.

use std::collections::{HashMap, VecDeque};

/// Per-key sliding window of accepted event timestamps (ms).
///
/// A call is accepted while fewer than `limit` accepted calls fall inside the
/// trailing `window_ms`. Only accepted calls are recorded, so a rejected burst
/// does not extend the penalty.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: usize,
    window_ms: u64,
    buckets: HashMap<String, VecDeque<u64>>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            buckets: HashMap::new(),
        }
    }

    /// Window given in seconds; oversized values saturate instead of overflowing.
    pub fn per_secs(limit: usize, window_secs: u64) -> Self {
        Self::new(limit, window_secs.saturating_mul(1_000))
    }

    pub const fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Accept or reject one event for `key` at `now`.
    pub fn check(&mut self, key: &str, now: u64) -> bool {
        let bucket = self.buckets.entry(key.to_string()).or_default();
        while bucket
            .front()
            .is_some_and(|&t| now.saturating_sub(t) >= self.window_ms)
        {
            bucket.pop_front();
        }
        if bucket.len() >= self.limit {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// Drop buckets whose newest entry is older than `idle_ms`.
    ///
    /// Returns the number of buckets removed.
    pub fn purge_idle(&mut self, now: u64, idle_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket
                .back()
                .is_some_and(|&t| now.saturating_sub(t) < idle_ms)
        });
        before - self.buckets.len()
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}
