//! Fault-tolerance primitives for calls into unreliable downstreams
//!
//! - [`CircuitBreaker`]: fail fast while a downstream is unhealthy
//! - [`RetryPolicy`]: exponential backoff with jitter for transient errors
//!
//! # Example
//!
//! ```ignore
//! use hearth_gateway::resilience::*;
//!
//! let breaker = CircuitBreaker::new("upstream", CircuitBreakerConfig::default())
//!     .on_state_change(|name, from, to| tracing::info!(name, ?from, ?to, "breaker"));
//! let policy = RetryPolicy::default();
//!
//! let value = policy
//!     .execute("fetch_states", || breaker.call(|| client.fetch_states()))
//!     .await?;
//! ```

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, StateListener,
};
pub use retry::RetryPolicy;
