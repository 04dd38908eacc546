//! The wire envelope exchanged with clients
//!
//! Every frame in either direction is a JSON object of the form
//!
//! ```text
//! { "type": "state_changed", "data": { ... }, "timestamp": "2024-03-01T12:00:00Z" }
//! ```
//!
//! Outbound envelopes are serialized once and the resulting [`Bytes`] are
//! shared by every recipient queue.

use crate::error::ProtocolError;
use crate::timestamp::deserialize_lenient;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Server-emitted envelope types that are not domain events
pub mod types {
    /// First frame sent to a newly registered client
    pub const WELCOME: &str = "welcome";
    /// Periodic liveness broadcast from the hub
    pub const HEARTBEAT: &str = "heartbeat";
    /// Reply to an application-level `ping`
    pub const PONG: &str = "pong";
    /// Acknowledges a topic or room subscription change
    pub const SUBSCRIPTION_CONFIRMED: &str = "subscription_confirmed";
}

/// JSON object payload of an envelope
pub type Data = Map<String, Value>;

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag
    #[serde(rename = "type")]
    pub message_type: String,

    /// Free-form payload
    #[serde(default, deserialize_with = "deserialize_data")]
    pub data: Data,

    /// Creation time; inbound values are decoded leniently
    #[serde(default = "Utc::now", deserialize_with = "deserialize_lenient")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(message_type: impl Into<String>, data: Data) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Decode an inbound frame
    pub fn from_slice(raw: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize to a shareable frame
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Greeting sent right after registration
    pub fn welcome(client_id: &str) -> Self {
        let mut data = Data::new();
        data.insert("client_id".into(), Value::from(client_id));
        data.insert("server_time".into(), Value::from(rfc3339_now()));
        data.insert(
            "message".into(),
            Value::from("Connected to hearth event stream"),
        );
        Self::new(types::WELCOME, data)
    }

    /// Hub liveness broadcast
    pub fn heartbeat(connected_clients: usize, uptime_secs: u64) -> Self {
        let mut data = Data::new();
        data.insert("server_time".into(), Value::from(rfc3339_now()));
        data.insert("connected_clients".into(), Value::from(connected_clients));
        data.insert("uptime_secs".into(), Value::from(uptime_secs));
        Self::new(types::HEARTBEAT, data)
    }

    /// Reply to an application `ping`
    pub fn pong() -> Self {
        let mut data = Data::new();
        data.insert("timestamp".into(), Value::from(rfc3339_now()));
        Self::new(types::PONG, data)
    }

    /// Acknowledge a subscription change, echoing what changed
    pub fn subscription_confirmed(data: Data) -> Self {
        Self::new(types::SUBSCRIPTION_CONFIRMED, data)
    }

    /// Look up a string field in `data`
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `data: null` is treated like a missing field
fn deserialize_data<'de, D>(deserializer: D) -> Result<Data, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Data>::deserialize(deserializer)?.unwrap_or_default())
}
