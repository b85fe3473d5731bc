//! Cache-aside layer
//!
//! [`CacheAside`] wraps expensive calls with get-or-compute semantics on top
//! of a pluggable [`CacheStore`]. The store is advisory: any store failure
//! degrades to calling the source.

pub mod aside;
pub mod store;

pub use self::aside::{CacheAside, CacheStatus, Cached};
pub use self::store::{CacheEntry, CacheStore, MemoryStore, RedisStore, StoreError};

use crate::gateway::bypass::path_has_prefix;
use serde::{Deserialize, Serialize};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable response caching for API routes
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum number of entries in the in-memory store
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    /// TTL for routes that do not set their own
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// API routes whose GET responses are cached
    #[serde(default)]
    pub routes: Vec<CacheRouteConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_capacity() -> u64 {
    10_000
}

fn default_ttl_secs() -> u64 {
    300 // 5 minutes
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_capacity: default_max_capacity(),
            default_ttl_secs: default_ttl_secs(),
            routes: vec![],
        }
    }
}

/// A cached API route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRouteConfig {
    /// Path prefix, e.g. `/api/news`
    pub prefix: String,
    /// Resource name used as the key namespace, e.g. `news`
    pub resource: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Keys deleted, with their query variants, after a successful write
    /// to this route. Entries may use `*` wildcards.
    #[serde(default)]
    pub invalidate_on_write: Vec<String>,
}

/// Looks up the cache route for a path and derives keys
#[derive(Debug, Clone, Default)]
pub struct CacheRoutes {
    routes: Vec<CacheRouteConfig>,
    default_ttl_secs: u64,
}

impl CacheRoutes {
    pub fn new(config: &CacheConfig) -> Self {
        let routes = if config.enabled {
            config.routes.clone()
        } else {
            vec![]
        };

        Self {
            routes,
            default_ttl_secs: config.default_ttl_secs,
        }
    }

    /// First route whose prefix covers `path`
    pub fn match_route(&self, path: &str) -> Option<&CacheRouteConfig> {
        self.routes
            .iter()
            .find(|route| path_has_prefix(path, &route.prefix))
    }

    pub fn ttl_for(&self, route: &CacheRouteConfig) -> u64 {
        route.ttl_secs.unwrap_or(self.default_ttl_secs)
    }

    /// Key for a request on `route`: `resource:remainder` (or `resource:list`)
    /// followed by the sorted query pairs
    pub fn key_for(&self, route: &CacheRouteConfig, path: &str, query: Option<&str>) -> String {
        let remainder = path
            .strip_prefix(route.prefix.as_str())
            .unwrap_or_default()
            .trim_matches('/');
        let part = if remainder.is_empty() { "list" } else { remainder };

        cache_key(&route.resource, part, query)
    }
}

/// Deterministic cache key from a resource, a part and filter parameters.
///
/// Query pairs are decoded and sorted so that `?b=2&a=1` and `?a=1&b=2`
/// share one entry.
pub fn cache_key(resource: &str, part: &str, query: Option<&str>) -> String {
    let mut pairs: Vec<(String, String)> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    if pairs.is_empty() {
        return format!("{}:{}", resource, part);
    }

    pairs.sort();
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{}:{}?{}", resource, part, query)
}
