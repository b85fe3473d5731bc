pub mod cache;
pub mod config;
pub mod error;
pub mod files;
pub mod gateway;
pub mod metrics;
pub mod observability;
pub mod rate_limit;
pub mod router;
pub mod threat;

use crate::config::GatewayConfig;
use crate::error::{error_body, GatewayError, Result};
use crate::gateway::{
    gateway_handler, health_handler, metrics_handler, security_headers_middleware, GatewayState,
};
use crate::metrics::MetricsService;
use crate::observability::request_id_middleware;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::any::Any;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// Assemble the HTTP application around a prepared state.
///
/// Layers, outermost first: security headers, panic guard, request span,
/// request id. Headers are outermost so that even panic responses carry them.
pub fn build_app(state: GatewayState) -> Router {
    let security_headers = state.security_headers.clone();

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(gateway_handler)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(
                    security_headers,
                    security_headers_middleware,
                ))
                .layer(CatchPanicLayer::custom(panic_response))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        tracing::info_span!(
                            "request",
                            method = %request.method(),
                            uri = %request.uri(),
                            request_id = tracing::field::Empty,
                        )
                    }),
                )
                .layer(middleware::from_fn(request_id_middleware)),
        )
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "Handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(error_body("Internal server error", "INTERNAL_ERROR")),
    )
        .into_response()
}

/// Initialize the gateway server
pub async fn init_gateway(config: GatewayConfig) -> Result<()> {
    config.validate()?;

    info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting gateway"
    );

    let metrics = MetricsService::new()?;
    let state = GatewayState::from_config(&config).await?.with_metrics(metrics);
    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(addr = %addr, "Gateway ready to accept connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
