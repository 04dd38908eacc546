//! Convenience re-exports for gateway authors.
//!
//! ```rust
//! use hearth_runtime::prelude::*;
//! ```

// Wire protocol
pub use hearth_core::{ControlMessage, Data, Envelope, Event, EventType};

// Hub and clients
pub use hearth_gateway::{
    ClientConfig, ClientInfo, DeliveryReport, Hub, HubConfig, HubHandle, HubMetrics, Target,
    entity_topic, room_topic,
};

// Forwarding
pub use hearth_gateway::{
    EventForwarder, ForwardOutcome, ForwarderConfig, ForwardingStats, TokenBucket,
};

// Resilience
pub use hearth_gateway::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};

// Upgrade endpoint
pub use hearth_gateway::{AllowAll, AuthDecision, Authenticator};

// Error types
pub use hearth_gateway::{ForwardError, GatewayError, HubError};

// Runtime
pub use crate::{Gateway, RuntimeBuilder};
