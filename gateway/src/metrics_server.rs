//! HTTP server for Prometheus metrics and health
//!
//! Runs on its own port, separate from the WebSocket listener.
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus metrics
//! - `GET /health` - JSON summary of the hub
//!
//! # Example
//!
//! ```ignore
//! use hearth_gateway::metrics_server::MetricsServer;
//!
//! let metrics_task = MetricsServer::start(config.metrics_addr, Some(hub.clone()));
//! ```

use crate::hub::HubHandle;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared state for the metrics server
#[derive(Clone)]
struct AppState {
    hub: Option<HubHandle>,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the metrics server on `addr`
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    /// The server runs until aborted or the process exits.
    pub fn start(addr: SocketAddr, hub: Option<HubHandle>) -> JoinHandle<()> {
        let state = AppState { hub };

        tokio::spawn(async move {
            let app = Router::new()
                .route("/metrics", get(metrics_handler))
                .route("/health", get(health_handler))
                .with_state(state);

            info!(addr = %addr, "Metrics server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %addr, "Failed to bind metrics server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[derive(Debug, Serialize)]
struct HealthSummary {
    status: &'static str,
    connected_clients: usize,
    topics: usize,
    uptime_secs: u64,
}

/// Handler for /health endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(hub) = state.hub else {
        return (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response();
    };

    let metrics = hub.metrics();
    let running = hub.is_running();
    let summary = HealthSummary {
        status: if running { "healthy" } else { "stopped" },
        connected_clients: metrics.connected_clients,
        topics: metrics.topic_count,
        uptime_secs: metrics.uptime_secs,
    };

    let code = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(summary)).into_response()
}
