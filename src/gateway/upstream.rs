use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::observability::REQUEST_ID_HEADER;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Application the gateway forwards non-file requests to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL, e.g. `http://127.0.0.1:3000`. Without it only files are served.
    #[serde(default)]
    pub url: Option<String>,
}

/// A fully buffered upstream response, storable in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Successful and not marked private by the application
    pub fn is_cacheable(&self) -> bool {
        if !self.is_success() {
            return false;
        }

        !self.headers.iter().any(|(name, value)| {
            let name = name.to_ascii_lowercase();
            name == "set-cookie"
                || (name == "cache-control"
                    && ["no-store", "no-cache", "private"]
                        .iter()
                        .any(|directive| value.to_ascii_lowercase().contains(directive)))
        })
    }

    pub fn into_response(self) -> Result<Response<Body>> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| GatewayError::Backend(format!("Invalid upstream status: {}", e)))?;

        let mut response = Response::builder().status(status);
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => response = response.header(name, value),
                _ => debug!(header = %name, "Dropping unrepresentable upstream header"),
            }
        }

        response
            .body(Body::from(self.body))
            .map_err(|e| GatewayError::Internal(format!("Failed to build response: {}", e)))
    }
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Request to forward, already read into memory
#[derive(Debug)]
pub struct ForwardRequest<'a> {
    pub method: &'a Method,
    pub path_and_query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub request_id: Option<&'a str>,
}

/// HTTP client for the application behind the gateway
#[derive(Debug, Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base_url: Option<Url>,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = config
            .url
            .as_deref()
            .map(|url| {
                Url::parse(url)
                    .map_err(|e| GatewayError::Config(format!("Invalid upstream URL '{}': {}", url, e)))
            })
            .transpose()?;

        Ok(Self { client, base_url })
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    /// Forward a request and buffer the response
    pub async fn forward(&self, request: ForwardRequest<'_>) -> Result<UpstreamResponse> {
        let Some(base_url) = &self.base_url else {
            return Err(GatewayError::NotFound(request.path_and_query.to_string()));
        };

        let target = base_url
            .join(request.path_and_query)
            .map_err(|e| GatewayError::Validation(format!("Invalid request path: {}", e)))?;

        debug!(target = %target, "Forwarding to upstream");

        let mut upstream_req = self
            .client
            .request(request.method.clone(), target)
            .body(request.body);

        for (name, value) in request.headers.iter() {
            if !is_hop_by_hop_header(name.as_str())
                && name != header::HOST
                && name.as_str() != "x-forwarded-for"
            {
                upstream_req = upstream_req.header(name, value);
            }
        }

        if let Some(forwarded_for) = forwarded_for(request.headers, request.client_ip) {
            upstream_req = upstream_req.header("x-forwarded-for", forwarded_for);
        }
        if let Some(request_id) = request.request_id {
            upstream_req = upstream_req.header(REQUEST_ID_HEADER, request_id);
        }

        let start = Instant::now();
        let upstream_response = upstream_req.send().await.map_err(|e| {
            warn!(error = %e, "Upstream request failed");
            if e.is_timeout() {
                GatewayError::BackendTimeout(format!("Upstream request timed out: {}", e))
            } else if e.is_connect() {
                GatewayError::BackendUnavailable(format!("Failed to connect to upstream: {}", e))
            } else {
                GatewayError::Backend(format!("Upstream request failed: {}", e))
            }
        })?;

        let status = upstream_response.status().as_u16();
        let headers = upstream_response
            .headers()
            .iter()
            .filter(|(name, _)| {
                !is_hop_by_hop_header(name.as_str()) && *name != header::CONTENT_LENGTH
            })
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let body = upstream_response
            .bytes()
            .await
            .map_err(|e| GatewayError::Backend(format!("Failed to read upstream response: {}", e)))?
            .to_vec();

        metrics::record_upstream_request(request.method.as_str(), status, start.elapsed().as_secs_f64());

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn forwarded_for(headers: &HeaderMap, client_ip: Option<IpAddr>) -> Option<String> {
    let existing = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (existing, client_ip) {
        (Some(existing), Some(ip)) => Some(format!("{}, {}", existing, ip)),
        (Some(existing), None) => Some(existing.to_string()),
        (None, Some(ip)) => Some(ip.to_string()),
        (None, None) => None,
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_is, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("X-API-Key"));
    }

    #[test]
    fn test_forwarded_for_chain() {
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_for(&headers, Some(ip)).as_deref(), Some("203.0.113.5"));

        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(
            forwarded_for(&headers, Some(ip)).as_deref(),
            Some("198.51.100.7, 203.0.113.5")
        );
        assert_eq!(forwarded_for(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_invalid_upstream_url() {
        let config = UpstreamConfig {
            url: Some("not a url".to_string()),
        };
        assert!(matches!(
            Upstream::new(&config, Duration::from_secs(1)).unwrap_err(),
            GatewayError::Config(_)
        ));
    }

    #[test]
    fn test_response_roundtrips_through_json() {
        let response = UpstreamResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: b"{\"items\":[]}".to_vec(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("eyJpdGVtcyI6W119"));
        assert_eq!(serde_json::from_str::<UpstreamResponse>(&json).unwrap(), response);
    }

    #[test]
    fn test_cacheability() {
        let mut response = UpstreamResponse {
            status: 200,
            headers: vec![],
            body: vec![],
        };
        assert!(response.is_cacheable());

        response.headers.push(("Cache-Control".to_string(), "private, max-age=0".to_string()));
        assert!(!response.is_cacheable());

        response.headers = vec![("set-cookie".to_string(), "sid=1".to_string())];
        assert!(!response.is_cacheable());

        response.headers.clear();
        response.status = 500;
        assert!(!response.is_cacheable());
    }

    #[tokio::test]
    async fn test_forward_without_upstream_is_not_found() {
        let upstream = Upstream::new(&UpstreamConfig::default(), Duration::from_secs(1)).unwrap();
        assert!(!upstream.is_configured());

        let err = upstream
            .forward(ForwardRequest {
                method: &Method::GET,
                path_and_query: "/api/news",
                headers: &HeaderMap::new(),
                body: Bytes::new(),
                client_ip: None,
                request_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_forward_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/news"))
            .and(query_param("page", "2"))
            .and(header_is("x-request-id", "req-1"))
            .and(header_is("x-forwarded-for", "203.0.113.5"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("[]", "application/json"),
            )
            .mount(&server)
            .await;

        let upstream = Upstream::new(
            &UpstreamConfig {
                url: Some(server.uri()),
            },
            Duration::from_secs(5),
        )
        .unwrap();

        let response = upstream
            .forward(ForwardRequest {
                method: &Method::GET,
                path_and_query: "/api/news?page=2",
                headers: &HeaderMap::new(),
                body: Bytes::new(),
                client_ip: Some("203.0.113.5".parse().unwrap()),
                request_id: Some("req-1"),
            })
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.body, b"[]");
        assert!(response
            .headers
            .iter()
            .any(|(name, value)| name == "content-type" && value == "application/json"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let upstream = Upstream::new(
            &UpstreamConfig {
                url: Some("http://127.0.0.1:9".to_string()),
            },
            Duration::from_secs(2),
        )
        .unwrap();

        let err = upstream
            .forward(ForwardRequest {
                method: &Method::GET,
                path_and_query: "/api/news",
                headers: &HeaderMap::new(),
                body: Bytes::new(),
                client_ip: None,
                request_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
