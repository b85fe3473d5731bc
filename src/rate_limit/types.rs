use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Identifier used when a request carries neither an API key nor a client IP.
///
/// Every such request shares this one bucket, so a missing identifier is
/// limited more aggressively rather than not at all.
pub const ANONYMOUS_IDENTIFIER: &str = "anonymous";

/// Quota for a single named limiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of requests allowed inside the window
    pub requests: u32,
    /// Sliding window length in milliseconds
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn new(requests: u32, window_ms: u64) -> Self {
        Self {
            requests,
            window_ms,
        }
    }

    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Picks a named limiter for requests whose path starts with `prefix`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRateLimit {
    /// Path prefix (matched on a segment boundary)
    pub prefix: String,
    /// HTTP methods this rule applies to (empty means all)
    #[serde(default)]
    pub methods: Vec<String>,
    /// Name of the limiter in `rate_limiting.limiters`
    pub limiter: String,
}

/// Rate limiting section of the gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Enable per-route rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Limiter used when no route rule matches
    #[serde(default = "default_limiter_name")]
    pub default_limiter: String,
    /// Limiter used for file downloads
    #[serde(default = "default_file_limiter_name")]
    pub file_limiter: String,
    /// Named limiters. Each name owns an independent set of windows.
    #[serde(default = "default_limiters")]
    pub limiters: BTreeMap<String, RateLimitConfig>,
    /// Ordered route overrides, first match wins
    #[serde(default)]
    pub routes: Vec<RouteRateLimit>,
    /// Keys accepted in `X-API-Key`. A listed key gets its own bucket;
    /// any other key is limited by client IP.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_limiter_name() -> String {
    "api".to_string()
}

fn default_file_limiter_name() -> String {
    "view-file".to_string()
}

fn default_limiters() -> BTreeMap<String, RateLimitConfig> {
    let mut limiters = BTreeMap::new();
    limiters.insert("api".to_string(), RateLimitConfig::new(120, 60_000));
    limiters.insert("view-file".to_string(), RateLimitConfig::new(60, 60_000));
    limiters.insert("submit-question".to_string(), RateLimitConfig::new(5, 60_000));
    limiters
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limiter: default_limiter_name(),
            file_limiter: default_file_limiter_name(),
            limiters: default_limiters(),
            routes: vec![],
            api_keys: vec![],
        }
    }
}

/// Rate limit result
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Remaining requests in the current window
    pub remaining: i64,
    /// Total limit
    pub limit: u32,
    /// When the oldest recorded request leaves the window (seconds from now)
    pub reset_after: u64,
    /// Retry after duration (for 429 responses)
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    /// Create an allowed result
    pub fn allowed(remaining: i64, limit: u32, reset_after: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            reset_after,
            retry_after: None,
        }
    }

    /// Create a denied result
    pub fn denied(limit: u32, retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_after: retry_after,
            retry_after: Some(retry_after),
        }
    }
}

/// Rate limit key: one window per `(limiter, identifier)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Name of the limiter (e.g. "submit-question")
    pub limiter: String,
    /// The client identifier (IP address or API key fingerprint)
    pub identifier: String,
}

impl RateLimitKey {
    /// Create a new rate limit key, folding empty identifiers into the shared bucket
    pub fn new(limiter: impl Into<String>, identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let identifier = if identifier.trim().is_empty() {
            ANONYMOUS_IDENTIFIER.to_string()
        } else {
            identifier
        };

        Self {
            limiter: limiter.into(),
            identifier,
        }
    }

    /// Key used by the in-process window map
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.limiter, self.identifier)
    }

    /// Convert to a Redis key
    pub fn to_redis_key(&self) -> String {
        format!("coopgate:ratelimit:{}:{}", self.limiter, self.identifier)
    }
}
