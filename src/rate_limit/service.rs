use super::local::SlidingWindowLimiter;
use super::redis::RedisRateLimiter;
use super::types::{RateLimitConfig, RateLimitKey, RateLimitResult};
use crate::error::{GatewayError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rate limiter service holding every named limiter.
///
/// Each limiter name keeps independent windows per identifier. When a Redis
/// backend is configured the windows live in Redis so that all gateway
/// processes share one quota; otherwise they live in this process.
pub struct RateLimiterService {
    limiters: BTreeMap<String, RateLimitConfig>,
    local: SlidingWindowLimiter,
    redis: Option<RedisRateLimiter>,
}

impl RateLimiterService {
    /// Create a new rate limiter service with in-process windows
    pub fn local_only(limiters: BTreeMap<String, RateLimitConfig>) -> Self {
        info!(limiters = limiters.len(), "Initializing local-only rate limiter");
        Self {
            limiters,
            local: SlidingWindowLimiter::new(),
            redis: None,
        }
    }

    /// Create a new rate limiter service with Redis backend and local fallback
    pub async fn with_redis(
        limiters: BTreeMap<String, RateLimitConfig>,
        redis_url: &str,
    ) -> std::result::Result<Self, redis::RedisError> {
        info!("Initializing rate limiter with Redis backend");

        let redis_limiter = RedisRateLimiter::new(redis_url).await?;

        match redis_limiter.ping().await {
            Ok(_) => {
                info!("Redis connection successful, using Redis as primary rate limiter");
                Ok(Self {
                    limiters,
                    local: SlidingWindowLimiter::new(),
                    redis: Some(redis_limiter),
                })
            }
            Err(e) => {
                warn!(
                    "Redis ping failed: {}, falling back to local rate limiter",
                    e
                );
                Ok(Self::local_only(limiters))
            }
        }
    }

    /// Check a request against a named limiter
    pub async fn check(&self, limiter: &str, identifier: &str) -> Result<RateLimitResult> {
        let config = self.limiters.get(limiter).ok_or_else(|| {
            GatewayError::Config(format!("Unknown rate limiter: {}", limiter))
        })?;

        let key = RateLimitKey::new(limiter, identifier);
        Ok(self.check_with(&key, config).await)
    }

    /// Check a request against an explicit quota
    pub async fn check_with(&self, key: &RateLimitKey, config: &RateLimitConfig) -> RateLimitResult {
        if let Some(redis) = &self.redis {
            match redis.check_rate_limit(key, config).await {
                Ok(result) => return result,
                Err(e) => {
                    warn!(error = %e, "Redis rate limit check failed, using local fallback");
                }
            }
        }

        self.local.check(key, config)
    }

    /// `true` if `identifier` may make another request under the given quota
    pub async fn is_allowed(
        &self,
        limiter: &str,
        identifier: &str,
        limit: u32,
        window_ms: u64,
    ) -> bool {
        let key = RateLimitKey::new(limiter, identifier);
        self.check_with(&key, &RateLimitConfig::new(limit, window_ms))
            .await
            .allowed
    }

    /// Drop idle local windows every `max_window`.
    ///
    /// `max_window` must cover the longest window any caller checks with.
    /// The task ends once the service is dropped.
    pub fn spawn_idle_purge(self: &Arc<Self>, max_window: Duration) {
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_window);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                let before = service.local.active_windows();
                service.local.purge_idle(max_window);
                debug!(
                    purged = before.saturating_sub(service.local.active_windows()),
                    "Purged idle rate limit windows"
                );
            }
        });
    }

    /// Check if Redis is available
    pub fn is_redis_available(&self) -> bool {
        self.redis.is_some()
    }

    /// Get the local rate limiter (for testing)
    #[cfg(test)]
    pub fn local(&self) -> &SlidingWindowLimiter {
        &self.local
    }
}
