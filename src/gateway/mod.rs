//! Request admission pipeline.
//!
//! Every request not answered by a built-in endpoint walks the same states:
//! internal-path guard, body limit, bypass check, threat screening, rate
//! check, route classification, then dispatch to the file server or the
//! upstream application (through the cache for configured read routes).
//! Any rejection ends the walk with a structured error response.

pub mod bypass;
pub mod headers;
pub mod upstream;

pub use self::bypass::{path_has_prefix, BypassList};
pub use self::headers::{default_security_headers, security_headers_middleware, SecurityHeaders};
pub use self::upstream::{ForwardRequest, Upstream, UpstreamConfig, UpstreamResponse};

use crate::cache::{CacheAside, CacheRoutes, CacheStore, MemoryStore, RedisStore};
use crate::config::{GatewayConfig, StoreBackend};
use crate::error::{GatewayError, Result};
use crate::files::{CategoryRegistry, FileServeError, FileServer, PathResolver};
use crate::metrics::{self, MetricsService};
use crate::observability::RequestId;
use crate::rate_limit::{
    add_rate_limit_headers, RateLimiterService, RouteLimits, ANONYMOUS_IDENTIFIER,
};
use crate::router::{self, FileRoute, FileRouter, RewriteTable};
use crate::threat::{patterns, ScanRequest, ThreatScanner};
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{header, request::Parts, HeaderMap, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const API_KEY_HEADER: &str = "x-api-key";
const FINGERPRINT_LEN: usize = 16;

/// Shared state for the gateway handler
#[derive(Clone)]
pub struct GatewayState {
    pub rewrites: Arc<RewriteTable>,
    pub file_router: Arc<FileRouter>,
    pub resolver: Arc<PathResolver>,
    pub file_server: FileServer,
    pub scanner: Arc<ThreatScanner>,
    pub rate_limiter: Arc<RateLimiterService>,
    pub route_limits: Arc<RouteLimits>,
    pub rate_limiting_enabled: bool,
    pub bypass: Arc<BypassList>,
    pub api_keys: Arc<ApiKeys>,
    pub cache: CacheAside,
    pub cache_routes: Arc<CacheRoutes>,
    pub upstream: Upstream,
    pub security_headers: Arc<SecurityHeaders>,
    pub metrics: Option<MetricsService>,
    pub max_body_bytes: usize,
    /// Proxy hops to count back in `X-Forwarded-For`, `None` to ignore it
    pub forwarded_hops: Option<usize>,
}

impl GatewayState {
    /// Build every component from validated configuration.
    ///
    /// The store backend is picked once here. An unreachable Redis falls
    /// back to in-process state with a warning.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let limiters = config.rate_limiting.limiters.clone();
        let redis_url = match config.store.backend {
            StoreBackend::Redis => config.store.redis_url.as_deref(),
            StoreBackend::Memory => None,
        };

        let rate_limiter = match redis_url {
            Some(url) => match RateLimiterService::with_redis(limiters.clone(), url).await {
                Ok(service) => service,
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, rate limits are per process");
                    RateLimiterService::local_only(limiters)
                }
            },
            None => RateLimiterService::local_only(limiters),
        };
        let rate_limiter = Arc::new(rate_limiter);
        rate_limiter.spawn_idle_purge(longest_window(config));

        let store: Arc<dyn CacheStore> = match redis_url {
            Some(url) => match RedisStore::new(url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, caching in process memory");
                    Arc::new(MemoryStore::new(config.cache.max_capacity))
                }
            },
            None => Arc::new(MemoryStore::new(config.cache.max_capacity)),
        };

        let registry = Arc::new(CategoryRegistry::from_config(&config.files)?);
        let scanner = ThreatScanner::new(&config.security, Arc::clone(&rate_limiter))?;

        let state = Self {
            rewrites: Arc::new(RewriteTable::new(&config.rewrites)?),
            file_router: Arc::new(FileRouter::new()?),
            resolver: Arc::new(PathResolver::new(registry)),
            file_server: FileServer::new(),
            scanner: Arc::new(scanner),
            rate_limiter,
            route_limits: Arc::new(RouteLimits::new(&config.rate_limiting)),
            rate_limiting_enabled: config.rate_limiting.enabled,
            bypass: Arc::new(BypassList::new(&config.security.bypass_prefixes)),
            api_keys: Arc::new(ApiKeys::new(&config.rate_limiting.api_keys)),
            cache: CacheAside::new(store, config.cache.default_ttl_secs),
            cache_routes: Arc::new(CacheRoutes::new(&config.cache)),
            upstream: Upstream::new(
                &config.upstream,
                Duration::from_secs(config.server.timeout_secs),
            )?,
            security_headers: Arc::new(SecurityHeaders::new(&config.security.headers)?),
            metrics: None,
            max_body_bytes: config.server.max_body_bytes,
            forwarded_hops: config
                .server
                .trust_forwarded_for
                .then_some(config.server.trusted_proxy_hops),
        };

        info!(
            categories = state.resolver.registry().names().len(),
            rewrites = state.rewrites.len(),
            cache_backend = state.cache.backend(),
            shared_rate_limits = state.rate_limiter.is_redis_available(),
            upstream = state.upstream.is_configured(),
            "Gateway state ready"
        );

        Ok(state)
    }

    /// Expose the Prometheus endpoint
    pub fn with_metrics(mut self, metrics: MetricsService) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Longest window any local limiter keeps timestamps for
fn longest_window(config: &GatewayConfig) -> Duration {
    config
        .rate_limiting
        .limiters
        .values()
        .chain(std::iter::once(&config.security.volume))
        .map(|limit| limit.window())
        .max()
        .unwrap_or(Duration::from_secs(60))
}

/// Where the client address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr {
    pub ip: IpAddr,
    /// Read from `X-Forwarded-For` rather than the socket
    pub forwarded: bool,
}

/// Client address.
///
/// Behind `hops` trusted proxies the client is the entry `hops` places from
/// the right of `X-Forwarded-For`; entries left of it are client-supplied.
/// A missing, short or unparsable header falls back to the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, forwarded_hops: Option<usize>) -> Option<ClientAddr> {
    if let Some(hops) = forwarded_hops {
        let chain: Vec<&str> = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .collect();

        let forwarded = chain
            .len()
            .checked_sub(hops)
            .and_then(|index| chain.get(index))
            .and_then(|hop| hop.parse().ok());
        if let Some(ip) = forwarded {
            return Some(ClientAddr { ip, forwarded: true });
        }
    }
    peer.map(|ip| ClientAddr { ip, forwarded: false })
}

/// Fingerprints of the API keys allowed their own rate-limit bucket
#[derive(Debug, Default)]
pub struct ApiKeys {
    fingerprints: HashSet<String>,
}

impl ApiKeys {
    pub fn new(keys: &[String]) -> Self {
        Self {
            fingerprints: keys.iter().map(|key| fingerprint(key.trim())).collect(),
        }
    }

    /// Fingerprint of the presented key, if it is a configured one
    pub fn identify(&self, headers: &HeaderMap) -> Option<&str> {
        let key = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|key| !key.is_empty())?;

        self.fingerprints.get(&fingerprint(key)).map(String::as_str)
    }
}

fn fingerprint(key: &str) -> String {
    let digest = URL_SAFE_NO_PAD.encode(Sha256::digest(key.as_bytes()));
    digest[..FINGERPRINT_LEN].to_string()
}

/// Rate-limit identity: the fingerprint of a configured API key, else the
/// client IP, else the shared anonymous bucket.
///
/// Unknown keys are ignored. The raw key never reaches logs or the store.
pub fn client_identifier(headers: &HeaderMap, ip: Option<IpAddr>, api_keys: &ApiKeys) -> String {
    if let Some(fingerprint) = api_keys.identify(headers) {
        return format!("key:{}", fingerprint);
    }

    ip.map(|ip| ip.to_string())
        .unwrap_or_else(|| ANONYMOUS_IDENTIFIER.to_string())
}

/// Where a screened request goes
#[derive(Debug)]
enum Dispatch {
    File(FileRoute),
    Forward(String),
}

/// Fallback handler running the admission pipeline
pub async fn gateway_handler(
    State(state): State<GatewayState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response {
    let request_id = req.extensions().get::<RequestId>().map(|id| id.0.clone());
    let timer = metrics::Timer::new(req.method().to_string(), req.uri().path().to_string());
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());

    let response = match admit(&state, peer, request_id.as_deref(), req).await {
        Ok(response) => response,
        Err(err) => {
            err.log(request_id.as_deref());
            err.into_response()
        }
    };

    timer.record(response.status().as_u16());
    response
}

async fn admit(
    state: &GatewayState,
    peer: Option<IpAddr>,
    request_id: Option<&str>,
    req: Request<Body>,
) -> Result<Response> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    if router::is_internal(&path) {
        warn!(target: "security", path = %path, "Direct request for internal path");
        return Err(GatewayError::NotFound(path));
    }

    let body = read_body(body, state.max_body_bytes).await?;

    let client = client_ip(&parts.headers, peer, state.forwarded_hops);
    let ip = client.map(|c| c.ip);
    let identifier = client_identifier(&parts.headers, ip, &state.api_keys);
    // Paths carrying traversal tokens are always screened
    let bypassed = !patterns::has_traversal_token(&path) && state.bypass.is_bypassed(&path);

    if !bypassed {
        let verdict = state
            .scanner
            .evaluate(&ScanRequest {
                method: &parts.method,
                path: &path,
                query: parts.uri.query(),
                headers: &parts.headers,
                body: &body,
                client_ip: ip,
                forwarded: client.is_some_and(|c| c.forwarded),
            })
            .await;

        if let Some(err) = verdict.to_error(&path) {
            if let Some(rule) = verdict.threats.first() {
                metrics::record_threat_blocked(rule);
            }
            warn!(
                target: "security",
                request_id = request_id.unwrap_or("-"),
                client = %identifier,
                path = %path,
                score = verdict.threat_score,
                threats = ?verdict.threats,
                "Request blocked by threat scanner"
            );
            return Err(err);
        }
    }

    let target = rewrite(state, &path);

    let rate = if bypassed || !state.rate_limiting_enabled {
        None
    } else {
        let is_file = router::is_internal(&target);
        let limiter = state.route_limits.limiter_for(&parts.method, &path, is_file);
        let result = state.rate_limiter.check(limiter, &identifier).await?;

        if !result.allowed {
            metrics::record_rate_limit_exceeded(limiter);
            warn!(
                target: "security",
                request_id = request_id.unwrap_or("-"),
                client = %identifier,
                limiter,
                path = %path,
                "Rate limit exceeded"
            );
            let err = GatewayError::RateLimited {
                retry_after_secs: result.retry_after.unwrap_or(1),
            };
            err.log(request_id);
            return Ok(add_rate_limit_headers(err.into_response(), &result));
        }
        Some(result)
    };

    let dispatch = match classify(state, &path, target, parts.uri.query()) {
        Ok(dispatch) => dispatch,
        Err(err) => {
            err.log(request_id);
            let response = err.into_response();
            return Ok(match rate {
                Some(result) => add_rate_limit_headers(response, &result),
                None => response,
            });
        }
    };

    let outcome = match dispatch {
        Dispatch::File(route) => serve_file(state, &parts, route, &identifier).await,
        Dispatch::Forward(target) => {
            forward(state, &parts, &path, target, body, peer, request_id).await
        }
    };

    let response = match outcome {
        Ok(response) => response,
        Err(err) => {
            err.log(request_id);
            err.into_response()
        }
    };

    Ok(match rate {
        Some(result) => add_rate_limit_headers(response, &result),
        None => response,
    })
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        debug!(error = %e, limit, "Request body rejected");
        GatewayError::BodyTooLarge { limit }
    })
}

/// Apply the rewrite table, keeping the path when no rule matches
fn rewrite(state: &GatewayState, path: &str) -> String {
    match state.rewrites.rewrite(path) {
        Some(rewritten) => {
            debug!(from = %path, to = %rewritten, "Path rewritten");
            rewritten
        }
        None => path.to_string(),
    }
}

/// Decide between file delivery and forwarding for a rewritten path
fn classify(state: &GatewayState, path: &str, target: String, query: Option<&str>) -> Result<Dispatch> {
    if router::is_internal(&target) {
        return match state.file_router.match_file(&target)? {
            Some(route) => Ok(Dispatch::File(route)),
            None => Err(GatewayError::NotFound(path.to_string())),
        };
    }

    Ok(Dispatch::Forward(match query {
        Some(query) => format!("{}?{}", target, query),
        None => target,
    }))
}

async fn serve_file(
    state: &GatewayState,
    parts: &Parts,
    route: FileRoute,
    client: &str,
) -> Result<Response> {
    if parts.method != Method::GET && parts.method != Method::HEAD {
        return Err(GatewayError::MethodNotAllowed(parts.method.to_string()));
    }

    let resolved = state
        .resolver
        .resolve(&route.category, &route.segments)
        .map_err(|reason| {
            metrics::record_file_served(&route.category, "rejected");
            warn!(
                target: "security",
                category = %route.category,
                client,
                reason = %reason,
                "File request rejected"
            );
            GatewayError::from(reason)
        })?;

    match state.file_server.serve(&resolved, &parts.headers, client).await {
        Ok(file) => {
            let outcome = if file.not_modified { "not_modified" } else { "served" };
            metrics::record_file_served(&resolved.category.name, outcome);
            Ok(file.into_response())
        }
        Err(err) => {
            let outcome = match &err {
                FileServeError::NotFound(_) => "not_found",
                FileServeError::TooLarge { .. } => "too_large",
                FileServeError::Denied(_) => "denied",
                FileServeError::Io(_) => "error",
            };
            metrics::record_file_served(&resolved.category.name, outcome);
            Err(err.into())
        }
    }
}

async fn forward(
    state: &GatewayState,
    parts: &Parts,
    path: &str,
    target: String,
    body: Bytes,
    peer: Option<IpAddr>,
    request_id: Option<&str>,
) -> Result<Response> {
    let request = ForwardRequest {
        method: &parts.method,
        path_and_query: &target,
        headers: &parts.headers,
        body,
        client_ip: peer,
        request_id,
    };

    let Some(route) = state.cache_routes.match_route(path) else {
        return state.upstream.forward(request).await?.into_response();
    };

    if parts.method == Method::GET {
        let key = state.cache_routes.key_for(route, path, parts.uri.query());
        let ttl = state.cache_routes.ttl_for(route);

        let cached = state
            .cache
            .get_or_compute_if(
                &key,
                ttl,
                || state.upstream.forward(request),
                UpstreamResponse::is_cacheable,
            )
            .await?;

        let mut cache_headers = HeaderMap::new();
        cached.apply_headers(&mut cache_headers);

        let mut response = cached.value.into_response()?;
        response.headers_mut().extend(cache_headers);
        return Ok(response);
    }

    let upstream_response = state.upstream.forward(request).await?;

    if is_write(&parts.method) && upstream_response.is_success() {
        let mut keys = route.invalidate_on_write.clone();
        keys.push(state.cache_routes.key_for(route, path, None));
        let removed = state.cache.invalidate_with_variants(&keys).await;
        debug!(path, keys = ?keys, removed, "Invalidated cache after write");
    }

    upstream_response.into_response()
}

fn is_write(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::PATCH
        || *method == Method::DELETE
}

/// Liveness and component summary
pub async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "categories": state.resolver.registry().names(),
        "cache_backend": state.cache.backend(),
        "shared_rate_limits": state.rate_limiter.is_redis_available(),
        "upstream_configured": state.upstream.is_configured(),
    }))
}

/// Prometheus scrape endpoint
pub async fn metrics_handler(State(state): State<GatewayState>) -> Response {
    match &state.metrics {
        Some(metrics) => metrics.response(),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics disabled",
        )
            .into_response(),
    }
}
