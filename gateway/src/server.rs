//! WebSocket upgrade endpoint
//!
//! `GET /ws` asks the [`Authenticator`] first, then upgrades and hands the
//! socket to [`client::serve`](crate::client::serve). Credential checks live
//! outside this crate; the authenticator only reports the outcome.

use crate::client::{self, Client, ClientConfig, ClientMetadata};
use crate::hub::HubHandle;
use crate::metrics::Metrics;
use crate::ws;
use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of an upgrade request's auth check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Refuse with 401
    Deny,
    /// Upgrade; `authenticated` is fixed on the client for its lifetime
    Allow {
        /// Whether the caller presented valid credentials
        authenticated: bool,
    },
}

/// External auth collaborator
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Decide on an upgrade request from its headers
    async fn authenticate(&self, headers: &HeaderMap) -> AuthDecision;
}

/// Admits everyone as unauthenticated
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _headers: &HeaderMap) -> AuthDecision {
        AuthDecision::Allow {
            authenticated: false,
        }
    }
}

/// Shared state for the upgrade route
#[derive(Clone)]
pub struct GatewayState {
    hub: HubHandle,
    client_config: ClientConfig,
    authenticator: Arc<dyn Authenticator>,
}

impl GatewayState {
    /// State admitting every connection
    pub fn new(hub: HubHandle, client_config: ClientConfig) -> Self {
        Self {
            hub,
            client_config,
            authenticator: Arc::new(AllowAll),
        }
    }

    /// Replace the authenticator
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }
}

/// Router exposing `GET /ws`
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let authenticated = match state.authenticator.authenticate(&headers).await {
        AuthDecision::Allow { authenticated } => authenticated,
        AuthDecision::Deny => {
            if let Some(metrics) = Metrics::get() {
                metrics.record_rejected("unauthorized");
            }
            warn!(
                remote_addr = remote_addr(&headers).as_deref().unwrap_or("unknown"),
                "Upgrade denied"
            );
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let metadata = metadata_from_headers(&headers);
    let config = state.client_config.clone();
    let hub = state.hub.clone();
    // Oversized frames below this are dropped by the reader without
    // closing; this only bounds what the socket will buffer
    let hard_limit = config.max_message_size.saturating_mul(16).max(64 * 1024);

    upgrade
        .max_message_size(hard_limit)
        .on_upgrade(move |socket| async move {
            let (sink, source) = ws::split(socket);
            let client = Client::new(&config, metadata, authenticated);
            if let Err(e) = client::serve(client, hub, config, sink, source).await {
                debug!(error = %e, "Connection refused by hub");
            }
        })
}

/// Connection metadata from proxy and client headers
pub fn metadata_from_headers(headers: &HeaderMap) -> ClientMetadata {
    ClientMetadata {
        remote_addr: remote_addr(headers),
        user_agent: header(headers, "user-agent"),
    }
}

fn remote_addr(headers: &HeaderMap) -> Option<String> {
    header(headers, "x-forwarded-for")
        .and_then(|list| list.split(',').next().map(|ip| ip.trim().to_string()))
        .filter(|ip| !ip.is_empty())
        .or_else(|| header(headers, "x-real-ip"))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use axum::http::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct DenyAll;

    #[async_trait]
    impl Authenticator for DenyAll {
        async fn authenticate(&self, _headers: &HeaderMap) -> AuthDecision {
            AuthDecision::Deny
        }
    }

    async fn status_of(state: GatewayState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        response.lines().next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn denied_requests_get_401() {
        let (hub, _task) = Hub::new().start();
        let state =
            GatewayState::new(hub, ClientConfig::default()).with_authenticator(Arc::new(DenyAll));
        assert!(status_of(state).await.contains("401"));
    }

    #[tokio::test]
    async fn allowed_non_upgrade_requests_are_rejected_by_axum() {
        let (hub, _task) = Hub::new().start();
        let state = GatewayState::new(hub.clone(), ClientConfig::default());
        let status = status_of(state).await;
        assert!(!status.contains("401"));
        assert!(status.contains(" 4"));
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn forwarded_for_wins_over_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7, 172.16.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        headers.insert("user-agent", HeaderValue::from_static("hearth-panel/2.1"));

        let meta = metadata_from_headers(&headers);
        assert_eq!(meta.remote_addr.as_deref(), Some("10.0.0.7"));
        assert_eq!(meta.user_agent.as_deref(), Some("hearth-panel/2.1"));

        headers.remove("x-forwarded-for");
        assert_eq!(
            metadata_from_headers(&headers).remote_addr.as_deref(),
            Some("10.0.0.9")
        );
        assert_eq!(metadata_from_headers(&HeaderMap::new()), ClientMetadata::default());
    }

    #[tokio::test]
    async fn default_authenticator_admits_unauthenticated() {
        assert_eq!(
            AllowAll.authenticate(&HeaderMap::new()).await,
            AuthDecision::Allow {
                authenticated: false
            }
        );
    }
}
