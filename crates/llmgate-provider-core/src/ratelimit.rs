//! Component E: per-channel request throttling, independent of the quota
//! manager (a channel can be within quota but still over its configured
//! requests-per-minute ceiling). A token bucket models `rate_limit_rpm`;
//! `queue_enabled` turns a would-be rejection into a bounded wait instead.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Channel;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub queued: bool,
    pub wait: Duration,
    pub error: Option<&'static str>,
}

impl RateLimitOutcome {
    fn immediate() -> Self {
        Self { allowed: true, queued: false, wait: Duration::ZERO, error: None }
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rpm: u32) -> Self {
        let capacity = rpm.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires one slot on `channel`. `rate_limit_rpm = 0` means unlimited.
    /// When the bucket is empty and `queue_enabled` is set, polls for up to
    /// `queue_timeout_ms` before giving up; otherwise rejects immediately.
    pub async fn acquire(&self, channel: &Channel) -> RateLimitOutcome {
        if channel.rate_limit_rpm == 0 {
            return RateLimitOutcome::immediate();
        }

        let start = Instant::now();
        loop {
            let took = {
                let mut guard = self.buckets.lock().expect("ratelimit mutex poisoned");
                let bucket = guard
                    .entry(channel.id.clone())
                    .or_insert_with(|| Bucket::new(channel.rate_limit_rpm));
                bucket.try_take()
            };
            if took {
                let wait = start.elapsed();
                return RateLimitOutcome { allowed: true, queued: wait > Duration::ZERO, wait, error: None };
            }
            if !channel.queue_enabled {
                return RateLimitOutcome { allowed: false, queued: false, wait: Duration::ZERO, error: Some("rate_limited") };
            }
            if start.elapsed() >= Duration::from_millis(channel.queue_timeout_ms.max(1)) {
                return RateLimitOutcome {
                    allowed: false,
                    queued: true,
                    wait: start.elapsed(),
                    error: Some("queue_timeout"),
                };
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn clear_channel(&self, channel_id: &str) {
        self.buckets.lock().expect("ratelimit mutex poisoned").remove(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(rpm: u32, queue_enabled: bool, queue_timeout_ms: u64) -> Channel {
        serde_json::from_value(serde_json::json!({
            "id": "c",
            "service_type": "claude",
            "rate_limit_rpm": rpm,
            "queue_enabled": queue_enabled,
            "queue_timeout_ms": queue_timeout_ms,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unlimited_channel_always_allows() {
        let limiter = RateLimiter::new();
        let channel = channel(0, false, 0);
        for _ in 0..10 {
            assert!(limiter.acquire(&channel).await.allowed);
        }
    }

    #[tokio::test]
    async fn exhausted_bucket_without_queue_rejects_immediately() {
        let limiter = RateLimiter::new();
        let channel = channel(1, false, 0);
        assert!(limiter.acquire(&channel).await.allowed);
        let outcome = limiter.acquire(&channel).await;
        assert!(!outcome.allowed);
        assert_eq!(outcome.error, Some("rate_limited"));
    }

    #[tokio::test]
    async fn exhausted_bucket_with_queue_times_out() {
        let limiter = RateLimiter::new();
        let channel = channel(1, true, 50);
        assert!(limiter.acquire(&channel).await.allowed);
        let outcome = limiter.acquire(&channel).await;
        assert!(!outcome.allowed);
        assert_eq!(outcome.error, Some("queue_timeout"));
    }
}
