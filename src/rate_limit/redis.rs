use super::lua_scripts::SLIDING_WINDOW_SCRIPT;
use super::types::{RateLimitConfig, RateLimitKey, RateLimitResult};
use redis::{aio::ConnectionManager, Script};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Redis-backed sliding window limiter shared by every gateway process
#[derive(Clone)]
pub struct RedisRateLimiter {
    connection: ConnectionManager,
    script: Script,
}

impl RedisRateLimiter {
    /// Create a new Redis rate limiter
    pub async fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    /// Check if a request is allowed.
    ///
    /// Errors are returned to the caller, which decides how to degrade.
    pub async fn check_rate_limit(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult, redis::RedisError> {
        let redis_key = key.to_redis_key();
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let member = format!("{}:{}", now_ms, uuid::Uuid::new_v4());

        let mut connection = self.connection.clone();
        let result = self
            .script
            .key(&redis_key)
            .arg(config.requests)
            .arg(config.window_ms)
            .arg(now_ms)
            .arg(member)
            .invoke_async::<_, Vec<i64>>(&mut connection)
            .await?;

        let allowed = result.first().copied().unwrap_or(0) == 1;
        let remaining = result.get(1).copied().unwrap_or(0);
        let reset_after_ms = result.get(2).copied().unwrap_or(config.window_ms as i64).max(0) as u64;
        let reset_after = reset_after_ms.div_ceil(1000);

        debug!(
            key = %redis_key,
            allowed,
            remaining,
            reset_after,
            "Sliding window check"
        );

        if allowed {
            Ok(RateLimitResult::allowed(remaining, config.requests, reset_after))
        } else {
            warn!(target: "security", key = %redis_key, "Rate limit exceeded");
            Ok(RateLimitResult::denied(config.requests, reset_after.max(1)))
        }
    }

    /// Ping Redis to check connection
    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_limiter() -> Option<RedisRateLimiter> {
        RedisRateLimiter::new("redis://127.0.0.1:6379").await.ok()
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_sliding_window() {
        let limiter = create_test_limiter()
            .await
            .expect("Failed to connect to Redis");
        let config = RateLimitConfig::new(10, 60_000);
        let key = RateLimitKey::new("test", format!("sw-{}", rand::random::<u32>()));

        for _ in 0..10 {
            let result = limiter.check_rate_limit(&key, &config).await.unwrap();
            assert!(result.allowed);
        }

        let result = limiter.check_rate_limit(&key, &config).await.unwrap();
        assert!(!result.allowed);
        assert!(result.retry_after.is_some());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_connection() {
        let limiter = create_test_limiter()
            .await
            .expect("Failed to connect to Redis");
        assert!(limiter.ping().await.is_ok());
    }
}
