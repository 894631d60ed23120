//! HTTP server for health checks and Prometheus metrics.
//!
//! Exposes:
//! - `/health` - Always returns 200 OK if the process is running
//! - `/ready` - Returns 200 OK once the readiness check passes
//! - `/metrics` - Prometheus exposition format metrics from [`REGISTRY`]
//!
//! ## Usage
//!
//! ```ignore
//! let coordinator = Arc::new(coordinator);
//! let ready = {
//!     let coordinator = coordinator.clone();
//!     Arc::new(move || coordinator.all_ready_now())
//! };
//!
//! MetricsServer::new("0.0.0.0:9090".parse()?, ready).start().await?;
//! ```

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::metrics::REGISTRY;

/// Answers the `/ready` probe.
pub type ReadinessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Handler for Prometheus metrics endpoint
pub async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check handler - always returns 200 OK if process is running.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// Readiness check handler.
async fn ready_handler(State(ready): State<ReadinessCheck>) -> Response {
    if ready() {
        "READY".into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

/// Create metrics router
pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Create the full health, readiness and metrics router
pub fn create_router(ready: ReadinessCheck) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(ready)
}

/// HTTP server for health checks and metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    ready: ReadinessCheck,
}

impl MetricsServer {
    pub fn new(addr: SocketAddr, ready: ReadinessCheck) -> Self {
        Self { addr, ready }
    }

    /// Start the HTTP server.
    ///
    /// This method blocks until the server is shut down.
    pub async fn start(self) -> std::io::Result<()> {
        let app = create_router(self.ready);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        tracing::info!(addr = %self.addr, "Metrics server listening");

        axum::serve(listener, app).await
    }
}
