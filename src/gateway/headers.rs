use crate::error::{GatewayError, Result};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Headers attached to every response unless configured otherwise
pub fn default_security_headers() -> BTreeMap<String, String> {
    [
        ("X-Frame-Options", "DENY"),
        ("X-Content-Type-Options", "nosniff"),
        ("X-XSS-Protection", "1; mode=block"),
        ("Referrer-Policy", "strict-origin-when-cross-origin"),
        (
            "Strict-Transport-Security",
            "max-age=31536000; includeSubDomains",
        ),
        (
            "Content-Security-Policy",
            "default-src 'self'; img-src 'self' data: https:; script-src 'self'; style-src 'self' 'unsafe-inline'; frame-ancestors 'none'",
        ),
        ("Permissions-Policy", "camera=(), microphone=(), geolocation=()"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

/// Parsed, ready-to-insert security header set
#[derive(Debug, Clone, Default)]
pub struct SecurityHeaders {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl SecurityHeaders {
    pub fn new(config: &BTreeMap<String, String>) -> Result<Self> {
        let headers = config
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    GatewayError::Config(format!("Invalid security header name '{}': {}", name, e))
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| {
                    GatewayError::Config(format!("Invalid value for header '{}': {}", name, e))
                })?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { headers })
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
    }

}

/// Attach the security header set to every response, errors included
pub async fn security_headers_middleware(
    State(security_headers): State<Arc<SecurityHeaders>>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    security_headers.apply(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use tower::ServiceExt;

    #[test]
    fn test_default_headers_parse() {
        let headers = SecurityHeaders::new(&default_security_headers()).unwrap();

        let mut map = HeaderMap::new();
        headers.apply(&mut map);
        assert_eq!(map.len(), 7);
        assert_eq!(map["x-frame-options"], "DENY");
        assert!(map.contains_key("content-security-policy"));
        assert!(map.contains_key("strict-transport-security"));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut config = BTreeMap::new();
        config.insert("Bad Header".to_string(), "x".to_string());
        assert!(matches!(
            SecurityHeaders::new(&config).unwrap_err(),
            GatewayError::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_middleware_sets_headers() {
        let headers = Arc::new(SecurityHeaders::new(&default_security_headers()).unwrap());
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                headers,
                security_headers_middleware,
            ));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    }
}
