use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Logging severity attached to every error.
///
/// Only ever used to pick the log level; never for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file category: {0}")]
    UnknownCategory(String),

    #[error("File extension not allowed: {0}")]
    ExtensionNotAllowed(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Request blocked: {0}")]
    Forbidden(String),

    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Request body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownCategory(_) => StatusCode::BAD_REQUEST,
            GatewayError::ExtensionNotAllowed(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::PathTraversal(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::FileNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BackendTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code returned to clients
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::UnknownCategory(_) => "INVALID_CATEGORY",
            GatewayError::ExtensionNotAllowed(_) => "INVALID_EXTENSION",
            GatewayError::Unauthorized(_) => "AUTHENTICATION_ERROR",
            GatewayError::Forbidden(_) => "SECURITY_BLOCKED",
            GatewayError::PathTraversal(_) => "PATH_TRAVERSAL",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::FileNotFound(_) => "FILE_NOT_FOUND",
            GatewayError::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            GatewayError::PayloadTooLarge { .. } => "FILE_TOO_LARGE",
            GatewayError::BodyTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            GatewayError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::BackendTimeout(_) => "DATABASE_TIMEOUT",
            GatewayError::BackendUnavailable(_) => "SERVICE_UNAVAILABLE",
            GatewayError::Backend(_) => "DATABASE_ERROR",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) | GatewayError::Io(_) => "INTERNAL_ERROR",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            GatewayError::PathTraversal(_) => Severity::Critical,
            GatewayError::Forbidden(_) => Severity::High,
            GatewayError::Config(_) | GatewayError::Internal(_) | GatewayError::Io(_) => {
                Severity::High
            }
            GatewayError::RateLimited { .. }
            | GatewayError::Unauthorized(_)
            | GatewayError::BackendTimeout(_)
            | GatewayError::BackendUnavailable(_)
            | GatewayError::Backend(_) => Severity::Medium,
            _ => Severity::Low,
        }
    }

    /// Message safe to show to clients.
    ///
    /// Server-side failures are collapsed into a generic message so that
    /// nothing about the host (paths, upstream addresses) leaks out.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Config(_) | GatewayError::Internal(_) | GatewayError::Io(_) => {
                "Internal server error".to_string()
            }
            GatewayError::Backend(_) => "Backend request failed".to_string(),
            GatewayError::BackendTimeout(_) => "Backend request timed out".to_string(),
            GatewayError::BackendUnavailable(_) => "Service temporarily unavailable".to_string(),
            GatewayError::PathTraversal(_) => "Access denied".to_string(),
            other => other.to_string(),
        }
    }

    /// Emit a log line at the level matching this error's severity
    pub fn log(&self, request_id: Option<&str>) {
        let request_id = request_id.unwrap_or("-");
        match self.severity() {
            Severity::Critical => error!(
                target: "security",
                request_id,
                code = self.code(),
                error = %self,
                "Request rejected"
            ),
            Severity::High => error!(request_id, code = self.code(), error = %self, "Request failed"),
            Severity::Medium => warn!(request_id, code = self.code(), error = %self, "Request failed"),
            Severity::Low => debug!(request_id, code = self.code(), error = %self, "Request rejected"),
        }
    }
}

/// Build the structured error body shared by every error response
pub fn error_body(message: &str, code: &str) -> serde_json::Value {
    json!({
        "success": false,
        "error": message,
        "code": code,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            info!(code = self.code(), detail = %self, "Returning generic server error");
        }

        let body = Json(error_body(&self.client_message(), self.code()));
        let mut response = (status, body).into_response();

        if let GatewayError::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::UnknownCategory("Foo".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::PathTraversal("..".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::PayloadTooLarge { size: 10, limit: 5 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::RateLimited { retry_after_secs: 3 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::BackendUnavailable("down".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Backend("query failed".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_display() {
        let err = GatewayError::FileNotFound("News/File/a.pdf".to_string());
        assert_eq!(err.to_string(), "File not found: News/File/a.pdf");
        assert_eq!(err.code(), "FILE_NOT_FOUND");
    }

    #[test]
    fn test_internal_details_not_exposed() {
        let err = GatewayError::Internal("failed to open /srv/uploads/secret".to_string());
        assert_eq!(err.client_message(), "Internal server error");

        let err = GatewayError::PathTraversal("/etc/passwd".to_string());
        assert!(!err.client_message().contains("passwd"));
    }

    #[test]
    fn test_severity_ordering() {
        assert_eq!(
            GatewayError::PathTraversal("x".to_string()).severity(),
            Severity::Critical
        );
        assert!(Severity::Critical > Severity::Low);
        assert_eq!(
            GatewayError::Validation("x".to_string()).severity(),
            Severity::Low
        );
    }

    #[tokio::test]
    async fn test_rate_limited_response_has_retry_after() {
        let response = GatewayError::RateLimited { retry_after_secs: 7 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "7");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["code"], "RATE_LIMIT_EXCEEDED");
        assert!(value["timestamp"].is_string());
    }
}
