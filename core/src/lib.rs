//! hearth-core - wire protocol for the hearth event hub
//!
//! Types shared by the gateway and anything that talks to it:
//!
//! - [`Envelope`] - the `{type, data, timestamp}` frame exchanged with clients
//! - [`Event`] / [`EventType`] - domain events forwarded to subscribers
//! - [`ControlMessage`] - inbound subscription control
//! - [`ErrorCategory`] / [`Categorized`] - failure classification used by
//!   retry and circuit-breaking logic
//! - [`parse_timestamp`] - lenient RFC 3339 / unix epoch decoding

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

/// Inbound control messages
pub mod control;
mod error;
/// Domain events
pub mod event;
/// The wire envelope
pub mod message;
mod timestamp;

pub use control::ControlMessage;
pub use error::{Categorized, ErrorCategory, ProtocolError};
pub use event::{Event, EventType, UnknownEventType};
pub use message::{Data, Envelope};
pub use timestamp::parse_timestamp;
