//! HEARTH Runtime - batteries-included event hub
//!
//! Provides [`run()`] for zero-boilerplate startup, and [`RuntimeBuilder`]
//! for users who need control over addresses or authentication.
//!
//! # Quick start
//!
//! ```ignore
//! use hearth_runtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     hearth_runtime::run(|gateway| async move {
//!         tokio::spawn(upstream_loop(gateway.forwarder));
//!         Ok(())
//!     }).await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;

use hearth_gateway::config::{Config, LogFormat};
use hearth_gateway::forwarder::EventForwarder;
use hearth_gateway::hub::{Hub, HubHandle};
use hearth_gateway::metrics::Metrics;
use hearth_gateway::metrics_server::MetricsServer;
use hearth_gateway::server::{Authenticator, GatewayState, router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Running hub and forwarder, handed to the configure closure
///
/// Clone freely; both fields are cheap handles.
#[derive(Clone, Debug)]
pub struct Gateway {
    /// Registry and broadcast engine
    pub hub: HubHandle,
    /// Ingestion API for upstream events
    pub forwarder: EventForwarder,
}

/// Run the event hub with default settings.
///
/// Loads configuration from environment variables, initialises tracing and
/// metrics, starts the hub and forwarder, calls your closure to wire up the
/// upstream event source, then serves `/ws` until SIGINT/SIGTERM.
///
/// # Example
///
/// ```ignore
/// hearth_runtime::run(|gateway| async move {
///     gateway.forwarder.update_room_filters(load_room_map().await?);
///     tokio::spawn(watch_upstream(gateway.forwarder.clone()));
///     Ok(())
/// }).await
/// ```
pub async fn run<F, Fut>(configure: F) -> anyhow::Result<()>
where
    F: FnOnce(Gateway) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    RuntimeBuilder::new().configure(configure).await
}

/// Power-user builder for controlling runtime behaviour.
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .listen_addr("127.0.0.1:3002".parse()?)
///     .metrics_port(9091)
///     .authenticator(Arc::new(SessionCheck::new(store)))
///     .configure(|gateway| async move { Ok(()) })
///     .await
/// ```
#[derive(Default)]
pub struct RuntimeBuilder {
    listen_addr: Option<SocketAddr>,
    metrics_port: Option<u16>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl RuntimeBuilder {
    /// Create a new builder with defaults from environment variables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the WebSocket listen address.
    ///
    /// Default: loaded from `HEARTH_LISTEN_ADDR`, or `0.0.0.0:3001`.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Override the metrics HTTP server port.
    ///
    /// Default: loaded from `HEARTH_METRICS_ADDR`, or `9090`.
    pub fn metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    /// Decide on upgrade requests. Default admits everyone unauthenticated.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Start everything and run to completion.
    ///
    /// This is the terminal method; it blocks until shutdown.
    pub async fn configure<F, Fut>(self, configure: F) -> anyhow::Result<()>
    where
        F: FnOnce(Gateway) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        // ── 1. Load config from env ──────────────────────────────
        let config = Config::from_env()?;

        // ── 2. Init tracing ──────────────────────────────────────
        init_tracing(&config);

        let listen_addr = self.listen_addr.unwrap_or(config.listen_addr);
        let mut metrics_addr = config.metrics_addr;
        if let Some(port) = self.metrics_port {
            metrics_addr.set_port(port);
        }

        info!(
            listen_addr = %listen_addr,
            metrics_addr = %metrics_addr,
            max_clients = config.hub.max_clients,
            queue_capacity = config.client.queue_capacity,
            "Starting HEARTH"
        );

        // ── 3. Hub and forwarder ─────────────────────────────────
        Metrics::init()?;
        let (hub, hub_task) = Hub::with_config(config.hub.clone()).start();
        let forwarder = EventForwarder::new(hub.clone(), config.forwarder.clone());
        forwarder.start();

        let metrics_task = MetricsServer::start(metrics_addr, Some(hub.clone()));
        info!(addr = %metrics_addr, "Metrics server started");

        // ── 4. User wires the upstream source ────────────────────
        configure(Gateway {
            hub: hub.clone(),
            forwarder: forwarder.clone(),
        })
        .await?;

        // ── 5. Serve /ws until a shutdown signal ─────────────────
        let mut state = GatewayState::new(hub.clone(), config.client.clone());
        if let Some(authenticator) = self.authenticator {
            state = state.with_authenticator(authenticator);
        }
        let listener = tokio::net::TcpListener::bind(listen_addr).await?;
        info!(addr = %listen_addr, "WebSocket endpoint listening on /ws");

        // Clients are closed before the server drains, so upgraded
        // connections don't hold graceful shutdown open
        let drain = {
            let hub = hub.clone();
            let forwarder = forwarder.clone();
            async move {
                shutdown_signal().await;
                forwarder.stop().await;
                hub.shutdown().await;
            }
        };
        axum::serve(listener, router(state))
            .with_graceful_shutdown(drain)
            .await?;

        // ── 6. Shutdown ──────────────────────────────────────────
        hub.shutdown().await;
        if let Err(e) = hub_task.await {
            tracing::error!(error = %e, "Hub task failed");
        }
        metrics_task.abort();
        info!("HEARTH shutdown complete");

        Ok(())
    }
}

/// Initialise the tracing subscriber based on config.
fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
