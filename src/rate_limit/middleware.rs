use super::types::{RateLimitResult, RateLimitingConfig, RouteRateLimit};
use crate::gateway::bypass::path_has_prefix;
use axum::{
    http::{HeaderMap, HeaderValue, Method},
    response::Response,
};
use tracing::debug;

/// Chooses which named limiter guards a request
#[derive(Debug, Clone)]
pub struct RouteLimits {
    routes: Vec<RouteRateLimit>,
    default_limiter: String,
    file_limiter: String,
}

impl RouteLimits {
    pub fn new(config: &RateLimitingConfig) -> Self {
        Self {
            routes: config.routes.clone(),
            default_limiter: config.default_limiter.clone(),
            file_limiter: config.file_limiter.clone(),
        }
    }

    /// Name of the limiter for a request.
    ///
    /// Route rules are checked in order; file downloads fall back to the
    /// file limiter and everything else to the default limiter.
    pub fn limiter_for(&self, method: &Method, path: &str, is_file: bool) -> &str {
        for route in &self.routes {
            let method_matches = route.methods.is_empty()
                || route
                    .methods
                    .iter()
                    .any(|m| m.eq_ignore_ascii_case(method.as_str()));

            if method_matches && path_has_prefix(path, &route.prefix) {
                debug!(limiter = %route.limiter, prefix = %route.prefix, "Route rate limit matched");
                return &route.limiter;
            }
        }

        if is_file {
            &self.file_limiter
        } else {
            &self.default_limiter
        }
    }
}

/// Build the `X-RateLimit-*` headers for a limiter result
pub fn rate_limit_headers(result: &RateLimitResult) -> HeaderMap {
    let mut headers = HeaderMap::new();

    headers.insert("X-RateLimit-Limit", HeaderValue::from(result.limit));
    headers.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from(result.remaining.max(0)),
    );
    headers.insert("X-RateLimit-Reset", HeaderValue::from(result.reset_after));

    if let Some(retry) = result.retry_after {
        headers.insert("Retry-After", HeaderValue::from(retry));
    }

    headers
}

/// Add rate limit headers to a response
pub fn add_rate_limit_headers(mut response: Response, result: &RateLimitResult) -> Response {
    response.headers_mut().extend(rate_limit_headers(result));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::types::RateLimitConfig;
    use axum::response::IntoResponse;

    fn route_limits() -> RouteLimits {
        let mut config = RateLimitingConfig::default();
        config.limiters.insert("login".to_string(), RateLimitConfig::new(5, 60_000));
        config.routes = vec![
            RouteRateLimit {
                prefix: "/api/questions".to_string(),
                methods: vec!["POST".to_string()],
                limiter: "submit-question".to_string(),
            },
            RouteRateLimit {
                prefix: "/api/login".to_string(),
                methods: vec![],
                limiter: "login".to_string(),
            },
        ];
        RouteLimits::new(&config)
    }

    #[test]
    fn test_route_rule_selects_limiter() {
        let limits = route_limits();
        assert_eq!(
            limits.limiter_for(&Method::POST, "/api/questions", false),
            "submit-question"
        );
        assert_eq!(limits.limiter_for(&Method::GET, "/api/login", false), "login");
    }

    #[test]
    fn test_method_mismatch_falls_back_to_default() {
        let limits = route_limits();
        assert_eq!(limits.limiter_for(&Method::GET, "/api/questions", false), "api");
    }

    #[test]
    fn test_prefix_matches_on_segment_boundary() {
        let limits = route_limits();
        assert_eq!(
            limits.limiter_for(&Method::POST, "/api/questions/12/answers", false),
            "submit-question"
        );
        assert_eq!(
            limits.limiter_for(&Method::POST, "/api/questionsbulk", false),
            "api"
        );
    }

    #[test]
    fn test_file_requests_use_file_limiter() {
        let limits = route_limits();
        assert_eq!(
            limits.limiter_for(&Method::GET, "/News/File/a.pdf", true),
            "view-file"
        );
    }

    #[test]
    fn test_rate_limit_headers() {
        let headers = rate_limit_headers(&RateLimitResult::denied(100, 30));
        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "100");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
        assert_eq!(headers.get("Retry-After").unwrap(), "30");

        let response = add_rate_limit_headers(
            "ok".into_response(),
            &RateLimitResult::allowed(4, 5, 60),
        );
        assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "4");
        assert!(response.headers().get("Retry-After").is_none());
    }
}
