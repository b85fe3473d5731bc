use crate::cache::CacheConfig;
use crate::error::{GatewayError, Result};
use crate::files::FilesConfig;
use crate::gateway::headers::SecurityHeaders;
use crate::gateway::upstream::UpstreamConfig;
use crate::observability::LoggingConfig;
use crate::rate_limit::{RateLimitConfig, RateLimitingConfig};
use crate::router::{default_rewrites, RewriteRule, RewriteTable};
use crate::threat::{IpAllowList, SecurityConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Prefix of environment overrides, e.g. `COOPGATE_SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "COOPGATE";

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub files: FilesConfig,
    /// Ordered URL rewrite table
    #[serde(default = "default_rewrites")]
    pub rewrites: Vec<RewriteRule>,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            store: StoreConfig::default(),
            files: FilesConfig::default(),
            rewrites: default_rewrites(),
            rate_limiting: RateLimitingConfig::default(),
            security: SecurityConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Largest request body accepted
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Take the client IP from `X-Forwarded-For`.
    /// Only enable behind a proxy that appends to the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Number of proxies in front of the gateway. The client IP is the hop
    /// this many entries from the right of `X-Forwarded-For`.
    #[serde(default = "default_trusted_proxy_hops")]
    pub trusted_proxy_hops: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_trusted_proxy_hops() -> usize {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
            max_body_bytes: default_max_body_bytes(),
            trust_forwarded_for: false,
            trusted_proxy_hops: default_trusted_proxy_hops(),
        }
    }
}

/// Where rate-limit windows and cache entries live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Per-process maps; quotas are per process
    #[default]
    Memory,
    /// Shared by every gateway process
    Redis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl GatewayConfig {
    /// Load configuration from an optional YAML file layered with
    /// `COOPGATE_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("security.ip_allowlist")
                .with_list_parse_key("security.user_agent_blacklist")
                .with_list_parse_key("security.bypass_prefixes")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| GatewayError::Config(format!("Failed to load config: {}", e)))
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.max_body_bytes == 0 {
            return Err(GatewayError::Config(
                "server.max_body_bytes must be > 0".to_string(),
            ));
        }

        if self.server.trust_forwarded_for && self.server.trusted_proxy_hops == 0 {
            return Err(GatewayError::Config(
                "server.trusted_proxy_hops must be > 0 when trust_forwarded_for is set".to_string(),
            ));
        }

        if let Some(url) = &self.upstream.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(GatewayError::Config(format!(
                    "Upstream URL must start with http:// or https://: {}",
                    url
                )));
            }
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(GatewayError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }

        self.validate_files()?;
        self.validate_rate_limits()?;

        RewriteTable::new(&self.rewrites)?;
        IpAllowList::new(&self.security.ip_allowlist)?;
        SecurityHeaders::new(&self.security.headers)?;
        for pattern in &self.security.malicious_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                GatewayError::Config(format!("Invalid malicious pattern '{}': {}", pattern, e))
            })?;
        }

        for route in &self.cache.routes {
            if !route.prefix.starts_with('/') || route.resource.is_empty() {
                return Err(GatewayError::Config(format!(
                    "Cache route needs a '/'-prefixed path and a resource name: {}",
                    route.prefix
                )));
            }
        }

        Ok(())
    }

    fn validate_files(&self) -> Result<()> {
        let mut names = HashSet::new();

        for category in &self.files.categories {
            if category.name.is_empty() {
                return Err(GatewayError::Config(
                    "File category name cannot be empty".to_string(),
                ));
            }
            if !names.insert(category.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate file category: {}",
                    category.name
                )));
            }
            if category.allowed_extensions.is_empty() {
                return Err(GatewayError::Config(format!(
                    "File category {} has no allowed extensions",
                    category.name
                )));
            }
            if category.max_file_size_bytes == 0 {
                return Err(GatewayError::Config(format!(
                    "File category {} must have max_file_size_bytes > 0",
                    category.name
                )));
            }
        }

        Ok(())
    }

    fn validate_rate_limits(&self) -> Result<()> {
        let limiting = &self.rate_limiting;

        for (name, limit) in &limiting.limiters {
            check_quota(limit, &format!("limiter {}", name))?;
        }
        check_quota(&self.security.volume, "security.volume")?;

        if limiting.api_keys.iter().any(|key| key.trim().is_empty()) {
            return Err(GatewayError::Config(
                "rate_limiting.api_keys cannot contain empty keys".to_string(),
            ));
        }

        if !limiting.enabled {
            return Ok(());
        }

        let referenced = [&limiting.default_limiter, &limiting.file_limiter]
            .into_iter()
            .chain(limiting.routes.iter().map(|route| &route.limiter));

        for name in referenced {
            if !limiting.limiters.contains_key(name) {
                return Err(GatewayError::Config(format!(
                    "Unknown rate limiter referenced: {}",
                    name
                )));
            }
        }

        Ok(())
    }
}

fn check_quota(limit: &RateLimitConfig, what: &str) -> Result<()> {
    if limit.requests == 0 {
        return Err(GatewayError::Config(format!(
            "Rate limit requests must be > 0 for {}",
            what
        )));
    }
    if limit.window_ms == 0 {
        return Err(GatewayError::Config(format!(
            "Rate limit window must be > 0 for {}",
            what
        )));
    }
    Ok(())
}
