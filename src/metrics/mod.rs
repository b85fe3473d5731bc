use crate::error::{GatewayError, Result};
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Handle to the installed Prometheus recorder
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Prometheus recorder installed");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_requests_total",
            "Total number of HTTP requests received"
        );
        describe_histogram!(
            "gateway_request_duration_seconds",
            "HTTP request latencies in seconds"
        );
        describe_counter!(
            "gateway_requests_errors_total",
            "Total number of HTTP requests that resulted in errors"
        );
        describe_counter!(
            "gateway_upstream_requests_total",
            "Total number of requests forwarded to the application"
        );
        describe_histogram!(
            "gateway_upstream_duration_seconds",
            "Upstream request latencies in seconds"
        );
        describe_counter!(
            "gateway_threats_blocked_total",
            "Requests denied by threat screening, by first matched rule"
        );
        describe_counter!(
            "gateway_rate_limit_exceeded_total",
            "Total number of requests rejected due to rate limiting"
        );
        describe_counter!(
            "gateway_cache_lookups_total",
            "Cache-aside lookups by result (hit or miss)"
        );
        describe_counter!(
            "gateway_cache_invalidations_total",
            "Cache keys deleted by invalidation"
        );
        describe_counter!(
            "gateway_files_served_total",
            "File requests by category and outcome"
        );

    }

    /// Prometheus text exposition
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Prometheus text response
    pub fn response(&self) -> Response {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            self.render(),
        )
            .into_response()
    }
}

/// Count and time one request, labelled by method, path and status
pub fn record_request(method: &str, path: &str, status: u16, duration: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(duration);

    if status >= 400 {
        counter!("gateway_requests_errors_total", &labels).increment(1);
    }
}

/// Record a request forwarded to the application
pub fn record_upstream_request(method: &str, status: u16, duration: f64) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];

    counter!("gateway_upstream_requests_total", &labels).increment(1);
    histogram!("gateway_upstream_duration_seconds", &labels).record(duration);
}

/// Record a request denied by threat screening
pub fn record_threat_blocked(rule: &str) {
    counter!("gateway_threats_blocked_total", "rule" => rule.to_string()).increment(1);
}

/// Record a request denied by a named limiter
pub fn record_rate_limit_exceeded(limiter: &str) {
    counter!("gateway_rate_limit_exceeded_total", "limiter" => limiter.to_string()).increment(1);
}

/// Record a cache-aside lookup
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("gateway_cache_lookups_total", "result" => result).increment(1);
}

/// Record deleted cache keys
pub fn record_cache_invalidation(count: u64) {
    counter!("gateway_cache_invalidations_total").increment(count);
}

/// Record a file request outcome (`served`, `not_modified`, `not_found`, ...)
pub fn record_file_served(category: &str, outcome: &'static str) {
    counter!(
        "gateway_files_served_total",
        "category" => category.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Path label with bounded cardinality.
///
/// File routes collapse to `/{Category}/File/*`; numeric ids, UUIDs and
/// 24-hex-digit object ids become `:id`.
fn sanitize_path(path: &str) -> String {
    let mut parts = path.splitn(4, '/');
    if let (Some(""), Some(category), Some("File"), Some(_)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    {
        return format!("/{}/File/*", category);
    }

    path.split('/')
        .map(|segment| if is_id_segment(segment) { ":id" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_id_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }

    segment.bytes().all(|b| b.is_ascii_digit())
        || uuid::Uuid::parse_str(segment).is_ok()
        || (segment.len() == 24 && segment.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Timer for measuring request duration
pub struct Timer {
    start: Instant,
    method: String,
    path: String,
}

impl Timer {
    /// Start a new timer for a request
    pub fn new(method: String, path: String) -> Self {
        Self {
            start: Instant::now(),
            method,
            path,
        }
    }

    /// Record the elapsed time with the given status code
    pub fn record(self, status: u16) {
        record_request(&self.method, &self.path, status, self.elapsed());
    }

    /// Get the elapsed time in seconds
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/api/news/123"), "/api/news/:id");
        assert_eq!(
            sanitize_path("/api/members/550e8400-e29b-41d4-a716-446655440000"),
            "/api/members/:id"
        );
        assert_eq!(sanitize_path("/api/news"), "/api/news");
        assert_eq!(
            sanitize_path("/News/File/2024/06/annual-report.pdf"),
            "/News/File/*"
        );
        assert_eq!(sanitize_path("/"), "/");
    }

    #[test]
    fn test_id_segments() {
        assert!(is_id_segment("42"));
        assert!(is_id_segment("550e8400-e29b-41d4-a716-446655440000"));
        assert!(is_id_segment("65f1c2a9b3e4d5f6a7b8c9d0"));
        assert!(!is_id_segment("business-reports"));
        assert!(!is_id_segment(""));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new("GET".to_string(), "/api/news".to_string());
        assert_eq!(timer.method, "GET");
        assert!(timer.elapsed() >= 0.0);
        timer.record(200);
    }

    #[test]
    fn test_record_functions_dont_panic() {
        // No recorder installed: every call is a no-op
        record_request("GET", "/api/news", 200, 0.012);
        record_upstream_request("POST", 201, 0.034);
        record_threat_blocked("directory_traversal");
        record_rate_limit_exceeded("submit-question");
        record_cache_lookup(true);
        record_cache_invalidation(3);
        record_file_served("News", "served");
    }
}
