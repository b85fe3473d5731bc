//! Rate limiting module
//!
//! Sliding-window admission control keyed by `(limiter, identifier)`.
//!
//! - **Local**: timestamp lists in a concurrent map, one per key
//! - **Redis**: the same window kept in a sorted set, shared by all processes
//!
//! The backend is chosen once at startup. A Redis error during a single
//! check degrades to the local window for that check.
//!
//! # Example
//!
//! ```rust,no_run
//! use coop_gateway::rate_limit::{RateLimitConfig, RateLimiterService};
//! use std::collections::BTreeMap;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut limiters = BTreeMap::new();
//!     limiters.insert("submit-question".to_string(), RateLimitConfig::new(3, 10_000));
//!
//!     let service = RateLimiterService::local_only(limiters);
//!     let result = service.check("submit-question", "203.0.113.5").await.unwrap();
//!     assert!(result.allowed);
//! }
//! ```

pub mod local;
pub mod lua_scripts;
pub mod middleware;
pub mod redis;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use self::middleware::{add_rate_limit_headers, rate_limit_headers, RouteLimits};
pub use self::service::RateLimiterService;
pub use self::types::{
    RateLimitConfig, RateLimitKey, RateLimitResult, RateLimitingConfig, RouteRateLimit,
    ANONYMOUS_IDENTIFIER,
};
