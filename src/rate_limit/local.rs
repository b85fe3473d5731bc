use super::types::{RateLimitConfig, RateLimitKey, RateLimitResult};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Local (in-memory) sliding-window rate limiter.
///
/// Keeps the admission timestamps of every `(limiter, identifier)` pair.
/// Entries older than the window are pruned on every check, then the
/// request is admitted only if fewer than `requests` timestamps remain.
/// Rejected requests are not recorded.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Check if a request is allowed right now
    pub fn check(&self, key: &RateLimitKey, config: &RateLimitConfig) -> RateLimitResult {
        let mut window = self.windows.entry(key.storage_key()).or_default();
        // Taken under the entry lock so timestamps stay ordered per key
        let now = Instant::now();
        Self::evaluate(window.value_mut(), key, config, now)
    }

    /// Check if a request is allowed at the given instant
    #[cfg(test)]
    fn check_at(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
        now: Instant,
    ) -> RateLimitResult {
        let mut window = self.windows.entry(key.storage_key()).or_default();
        Self::evaluate(window.value_mut(), key, config, now)
    }

    fn evaluate(
        timestamps: &mut VecDeque<Instant>,
        key: &RateLimitKey,
        config: &RateLimitConfig,
        now: Instant,
    ) -> RateLimitResult {
        let window = config.window();

        while let Some(oldest) = timestamps.front() {
            if *oldest + window <= now {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        let count = timestamps.len() as u32;
        if count < config.requests {
            timestamps.push_back(now);
            let reset_after = until_oldest_expires(timestamps, window, now);
            debug!(
                limiter = %key.limiter,
                identifier = %key.identifier,
                count = count + 1,
                "Rate limit check passed"
            );
            RateLimitResult::allowed(
                (config.requests - count - 1) as i64,
                config.requests,
                reset_after,
            )
        } else {
            let retry_after = until_oldest_expires(timestamps, window, now).max(1);
            warn!(
                target: "security",
                limiter = %key.limiter,
                identifier = %key.identifier,
                "Rate limit exceeded"
            );
            RateLimitResult::denied(config.requests, retry_after)
        }
    }

    /// Drop windows whose every timestamp is older than `max_window`
    pub fn purge_idle(&self, max_window: Duration) {
        let now = Instant::now();
        self.windows.retain(|_, timestamps| {
            timestamps
                .back()
                .map(|newest| *newest + max_window > now)
                .unwrap_or(false)
        });
    }

    /// Get the number of tracked windows (for testing/monitoring)
    pub fn active_windows(&self) -> usize {
        self.windows.len()
    }
}

/// Whole seconds until the oldest timestamp leaves the window, rounded up
fn until_oldest_expires(timestamps: &VecDeque<Instant>, window: Duration, now: Instant) -> u64 {
    let remaining = timestamps
        .front()
        .map(|oldest| (*oldest + window).saturating_duration_since(now))
        .unwrap_or(window);
    let millis = remaining.as_millis() as u64;
    millis.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_within_limit() {
        let limiter = SlidingWindowLimiter::new();
        let config = RateLimitConfig::new(10, 1_000);
        let key = RateLimitKey::new("api", "192.168.1.1");

        for i in 0..10 {
            let result = limiter.check(&key, &config);
            assert!(
                result.allowed,
                "Request {} should be allowed (remaining: {})",
                i, result.remaining
            );
        }
    }

    #[test]
    fn test_sliding_window_scenario() {
        // limit=3, window=10s; t=0,1,2 pass, t=3 is denied, t=11 passes
        let limiter = SlidingWindowLimiter::new();
        let config = RateLimitConfig::new(3, 10_000);
        let key = RateLimitKey::new("submit-question", "203.0.113.5");
        let start = Instant::now();
        let at = |secs: u64| start + Duration::from_secs(secs);

        assert!(limiter.check_at(&key, &config, at(0)).allowed);
        assert!(limiter.check_at(&key, &config, at(1)).allowed);
        let third = limiter.check_at(&key, &config, at(2));
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);

        let fourth = limiter.check_at(&key, &config, at(3));
        assert!(!fourth.allowed);
        assert_eq!(fourth.retry_after, Some(7));

        assert!(limiter.check_at(&key, &config, at(11)).allowed);
    }

    #[test]
    fn test_window_boundary_frees_slot() {
        let limiter = SlidingWindowLimiter::new();
        let config = RateLimitConfig::new(2, 10_000);
        let key = RateLimitKey::new("api", "10.0.0.1");
        let start = Instant::now();

        assert!(limiter.check_at(&key, &config, start).allowed);
        assert!(limiter.check_at(&key, &config, start + Duration::from_secs(5)).allowed);
        assert!(!limiter.check_at(&key, &config, start + Duration::from_secs(9)).allowed);
        // Exactly one window after the first request
        assert!(limiter.check_at(&key, &config, start + Duration::from_secs(10)).allowed);
    }

    #[test]
    fn test_denied_requests_are_not_recorded() {
        let limiter = SlidingWindowLimiter::new();
        let config = RateLimitConfig::new(1, 10_000);
        let key = RateLimitKey::new("api", "10.0.0.2");
        let start = Instant::now();

        assert!(limiter.check_at(&key, &config, start).allowed);
        for secs in 1..10 {
            assert!(!limiter.check_at(&key, &config, start + Duration::from_secs(secs)).allowed);
        }
        assert!(limiter.check_at(&key, &config, start + Duration::from_secs(10)).allowed);
    }

    #[test]
    fn test_different_identifiers_and_limiters() {
        let limiter = SlidingWindowLimiter::new();
        let config = RateLimitConfig::new(2, 60_000);
        let key1 = RateLimitKey::new("view-file", "192.168.1.1");
        let key2 = RateLimitKey::new("view-file", "192.168.1.2");
        let key3 = RateLimitKey::new("submit-question", "192.168.1.1");

        for _ in 0..2 {
            assert!(limiter.check(&key1, &config).allowed);
        }
        assert!(!limiter.check(&key1, &config).allowed);

        assert!(limiter.check(&key2, &config).allowed);
        assert!(limiter.check(&key3, &config).allowed);

        assert_eq!(limiter.active_windows(), 3);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let limiter = std::sync::Arc::new(SlidingWindowLimiter::new());
        let config = RateLimitConfig::new(50, 60_000);
        let key = RateLimitKey::new("api", "198.51.100.7");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let config = config.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check(&key, &config).allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle_windows() {
        let limiter = SlidingWindowLimiter::new();
        let config = RateLimitConfig::new(5, 1_000);
        limiter.check(&RateLimitKey::new("api", "a"), &config);
        limiter.check(&RateLimitKey::new("api", "b"), &config);
        assert_eq!(limiter.active_windows(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        limiter.purge_idle(Duration::from_secs(1));
        assert_eq!(limiter.active_windows(), 0);
    }
}
