use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const WINDOW: Duration = Duration::from_secs(60);

struct Bucket {
    /// Timestamps of requests admitted within the current window, oldest
    /// first. Trimmed on every check, so its length is always an accurate
    /// count of requests in the trailing 60 seconds.
    hits: Mutex<VecDeque<Instant>>,
    last_seen: Mutex<Instant>,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            hits: Mutex::new(VecDeque::new()),
            last_seen: Mutex::new(now),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the caller should retry, set when `allowed` is false.
    pub retry_after_secs: u64,
}

/// Per-client sliding-window rate limiter.
///
/// Buckets are sharded by `DashMap` so concurrent requests for different
/// clients never contend on the same lock; a single client's own requests
/// still serialize through that client's bucket mutex.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { buckets: DashMap::new() }
    }

    /// Check and, if allowed, record a request for `client_id` against
    /// `limit_rpm` requests per rolling 60-second window.
    pub fn check(&self, client_id: &str, limit_rpm: u32) -> RateLimitDecision {
        let now = Instant::now();
        let bucket = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| Bucket::new(now));
        *bucket.last_seen.lock().expect("bucket mutex poisoned") = now;

        let mut hits = bucket.hits.lock().expect("bucket mutex poisoned");
        while let Some(&front) = hits.front() {
            if now.duration_since(front) >= WINDOW {
                hits.pop_front();
            } else {
                break;
            }
        }

        if (hits.len() as u32) < limit_rpm {
            hits.push_back(now);
            RateLimitDecision {
                allowed: true,
                limit: limit_rpm,
                remaining: limit_rpm - hits.len() as u32,
                retry_after_secs: 0,
            }
        } else {
            let retry_after = hits
                .front()
                .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(WINDOW);
            let retry_after_secs = retry_after.as_secs().max(1);
            tracing::debug!(client_id, limit_rpm, retry_after_secs, "rate limit exceeded");
            RateLimitDecision {
                allowed: false,
                limit: limit_rpm,
                remaining: 0,
                retry_after_secs,
            }
        }
    }

    /// Drop buckets untouched for longer than `idle_timeout`, so a rate
    /// limiter that serves a churning population of clients doesn't grow
    /// unbounded.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter(|entry| {
                let last_seen = *entry.value().last_seen.lock().expect("bucket mutex poisoned");
                now.duration_since(last_seen) >= idle_timeout
            })
            .map(|entry| entry.key().clone())
            .collect();
        let count = stale.len();
        for key in stale {
            self.buckets.remove(&key);
        }
        count
    }

    pub fn active_clients(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            let decision = limiter.check("client-a", 3);
            assert!(decision.allowed);
        }
        let decision = limiter.check("client-a", 3);
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs > 0);
    }

    #[test]
    fn clients_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..2 {
            assert!(limiter.check("client-a", 2).allowed);
        }
        assert!(limiter.check("client-b", 2).allowed);
    }

    #[test]
    fn remaining_counts_down_monotonically() {
        let limiter = RateLimiter::new();
        let first = limiter.check("client-a", 5);
        let second = limiter.check("client-a", 5);
        assert!(second.remaining < first.remaining);
    }

    #[test]
    fn evicts_idle_buckets() {
        let limiter = RateLimiter::new();
        limiter.check("client-a", 10);
        assert_eq!(limiter.active_clients(), 1);
        let evicted = limiter.evict_idle(Duration::from_secs(0));
        assert_eq!(evicted, 1);
        assert_eq!(limiter.active_clients(), 0);
    }
}
