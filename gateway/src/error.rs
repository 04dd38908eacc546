//! Error types for the hearth gateway

use hearth_core::{Categorized, ErrorCategory};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway setup and lifecycle operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Top-level gateway error
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Hub error
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,
}

/// Errors returned by [`HubHandle`](crate::hub::HubHandle) operations
///
/// Slow or dead clients never surface here; they are evicted instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Registry is full, connection rejected
    #[error("hub at capacity ({max} clients)")]
    Capacity {
        /// Configured maximum
        max: usize,
    },

    /// The hub control loop has stopped
    #[error("hub is shut down")]
    Shutdown,

    /// The outbound envelope could not be encoded
    #[error("failed to encode message: {0}")]
    Serialization(String),
}

impl Categorized for HubError {
    fn category(&self) -> ErrorCategory {
        match self {
            HubError::Capacity { .. } => ErrorCategory::Capacity,
            HubError::Shutdown => ErrorCategory::Shutdown,
            HubError::Serialization(_) => ErrorCategory::Validation,
        }
    }
}

/// Socket-level failure; terminates the affected connection only
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer closed the connection
    #[error("connection closed")]
    Closed,

    /// Read or write deadline elapsed
    #[error("transport timed out")]
    Timeout,

    /// Underlying I/O failure
    #[error("transport error: {0}")]
    Io(String),
}

impl Categorized for TransportError {
    fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Closed | TransportError::Io(_) => ErrorCategory::Network,
            TransportError::Timeout => ErrorCategory::Timeout,
        }
    }
}

/// Outcome of a call guarded by a [`CircuitBreaker`](crate::resilience::CircuitBreaker)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitError<E> {
    /// Rejected without running the call
    #[error("circuit '{name}' is open, retry after {retry_after:?}")]
    Open {
        /// Breaker name
        name: String,
        /// Time until the breaker admits a trial call
        retry_after: Duration,
    },

    /// The call ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E: Categorized> Categorized for CircuitError<E> {
    fn category(&self) -> ErrorCategory {
        match self {
            CircuitError::Open { .. } => ErrorCategory::Unavailable,
            CircuitError::Inner(e) => e.category(),
        }
    }
}

/// Errors surfaced by the [`EventForwarder`](crate::forwarder::EventForwarder)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The delivery circuit is open
    #[error("event delivery unavailable, retry after {retry_after:?}")]
    Unavailable {
        /// Time until delivery is attempted again
        retry_after: Duration,
    },

    /// Hub rejected the delivery
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl From<CircuitError<HubError>> for ForwardError {
    fn from(err: CircuitError<HubError>) -> Self {
        match err {
            CircuitError::Open { retry_after, .. } => ForwardError::Unavailable { retry_after },
            CircuitError::Inner(e) => ForwardError::Hub(e),
        }
    }
}

impl Categorized for ForwardError {
    fn category(&self) -> ErrorCategory {
        match self {
            ForwardError::Unavailable { .. } => ErrorCategory::Unavailable,
            ForwardError::Hub(e) => e.category(),
        }
    }
}
