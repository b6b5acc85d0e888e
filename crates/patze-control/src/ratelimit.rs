//! Sliding-window rate limiting for bridge cron-sync, keyed by
//! `(machineId, sourceIp)`.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    max_per_window: u32,
    buckets: Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

pub enum RateDecision {
    Allowed,
    /// Denied; retry after this many seconds.
    Limited { retry_after_secs: u64 },
}

impl RateLimiter {
    pub fn new(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, machine_id: &str, source_ip: &str) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((machine_id.to_string(), source_ip.to_string()))
            .or_default();

        while let Some(front) = bucket.front() {
            if now.duration_since(*front) >= WINDOW {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() as u32 >= self.max_per_window {
            let retry_after = bucket
                .front()
                .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)).as_secs().max(1))
                .unwrap_or(1);
            return RateDecision::Limited {
                retry_after_secs: retry_after,
            };
        }

        bucket.push_back(now);
        RateDecision::Allowed
    }

    /// Drop buckets that have gone quiet; called opportunistically.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| bucket.back().is_some_and(|last| now.duration_since(*last) < WINDOW));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_per_key() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert!(matches!(limiter.check("m-1", "10.0.0.1"), RateDecision::Allowed));
        }
        assert!(matches!(
            limiter.check("m-1", "10.0.0.1"),
            RateDecision::Limited { .. }
        ));
        // A different source IP is a separate bucket.
        assert!(matches!(limiter.check("m-1", "10.0.0.2"), RateDecision::Allowed));
        // As is a different machine.
        assert!(matches!(limiter.check("m-2", "10.0.0.1"), RateDecision::Allowed));
    }

    #[test]
    fn test_retry_after_is_positive() {
        let limiter = RateLimiter::new(1);
        let _ = limiter.check("m-1", "ip");
        match limiter.check("m-1", "ip") {
            RateDecision::Limited { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            RateDecision::Allowed => panic!("expected limit"),
        }
    }

    #[test]
    fn test_sweep_drops_idle_buckets() {
        let limiter = RateLimiter::new(10);
        let _ = limiter.check("m-1", "ip");
        limiter.sweep();
        // Bucket is fresh, so it survives.
        assert_eq!(limiter.buckets.lock().len(), 1);
    }
}
