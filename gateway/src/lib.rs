//! HEARTH - real-time event hub for a home-automation gateway
//!
//! Accepts long-lived WebSocket clients and fans out domain events to them
//! with per-client filtering, global rate limiting, time-windowed batching
//! and backpressure eviction.
//!
//! # Architecture
//!
//! ```text
//! upstream ──► EventForwarder ──► Hub ──► Client queue ──► writer pump ──► socket
//!              (filter, bucket,   (registry,              reader pump ◄── socket
//!               batch, breaker)    fan-out, evict)         (subscriptions, ping)
//! ```
//!
//! The hub owns the registry and runs every mutation and fan-out on one
//! control loop. Slow clients are evicted, never waited on.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod client;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod hub;
pub mod metrics;
pub mod metrics_server;
pub mod rate_limit;
pub mod resilience;
pub mod server;
pub mod ws;

pub use client::{
    Client, ClientConfig, ClientId, ClientInfo, ClientMetadata, ConnectionState, Frame,
    FrameSink, FrameSource, OutboundQueue, PushError, Scope, Subscriptions,
};
pub use config::{Config, LogFormat};
pub use error::{CircuitError, ForwardError, GatewayError, HubError, Result, TransportError};
pub use forwarder::{
    EventForwarder, ForwardOutcome, ForwarderConfig, ForwardingErrorRecord, ForwardingStats,
};
pub use hub::{
    ClientFilter, DeliveryReport, EvictReason, Hub, HubConfig, HubHandle, HubMetrics, HubRunner,
    Target, entity_topic, room_topic,
};
pub use metrics::Metrics;
pub use metrics_server::MetricsServer;
pub use rate_limit::TokenBucket;
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, RetryPolicy,
    StateListener,
};
pub use server::{AllowAll, AuthDecision, Authenticator, GatewayState, router};
