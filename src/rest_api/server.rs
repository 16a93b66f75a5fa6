//! Axum HTTP server for health probes and metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerState;
use crate::error::{Error, Result};

/// Liveness: the process is serving requests
async fn healthz() -> &'static str {
    "ok"
}

/// Readiness: every informer cache has completed its initial sync
async fn readyz(State(state): State<Arc<ControllerState>>) -> (StatusCode, &'static str) {
    readiness(state.is_ready())
}

fn readiness(synced: bool) -> (StatusCode, &'static str) {
    if synced {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

/// Metrics endpoint handler
async fn metrics_handler() -> (StatusCode, String) {
    match encode_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn encode_metrics() -> std::result::Result<String, std::fmt::Error> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)?;
    Ok(buffer)
}

/// Build the router serving the probe and metrics endpoints
pub fn router(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until `shutdown` is cancelled
pub async fn run_server(
    state: Arc<ControllerState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(state);

    info!("HTTP server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::metrics;

    #[test]
    fn readiness_reflects_cache_sync() {
        assert_eq!(readiness(false).0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(readiness(true).0, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_are_exposed_in_text_format() {
        metrics::record_sync("success");
        let (status, body) = metrics_handler().await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("net_attach_def_controller_syncs_total"));
        assert!(body.ends_with("# EOF\n"));
    }
}
