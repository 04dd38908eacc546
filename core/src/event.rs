//! Domain events flowing from the automation source to clients

use crate::message::{Data, Envelope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of domain event; the wire name doubles as the envelope `type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// An entity changed state
    StateChanged,
    /// An entity was created
    EntityAdded,
    /// An entity was deleted
    EntityRemoved,
    /// A room/area was created or changed
    AreaUpdated,
    /// Upstream synchronization progress
    SyncStatus,
    /// A service was invoked upstream
    ServiceCalled,
}

impl EventType {
    /// Every event type, in declaration order
    pub const ALL: [EventType; 6] = [
        EventType::StateChanged,
        EventType::EntityAdded,
        EventType::EntityRemoved,
        EventType::AreaUpdated,
        EventType::SyncStatus,
        EventType::ServiceCalled,
    ];

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::StateChanged => "state_changed",
            EventType::EntityAdded => "entity_added",
            EventType::EntityRemoved => "entity_removed",
            EventType::AreaUpdated => "area_updated",
            EventType::SyncStatus => "sync_status",
            EventType::ServiceCalled => "service_called",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown event type name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type '{0}'")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// A domain event ready for forwarding
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event kind
    pub event_type: EventType,
    /// Entity the event concerns, if any
    pub entity_id: Option<String>,
    /// Room the entity belongs to, if known
    pub room_id: Option<String>,
    /// Opaque payload, becomes the envelope `data`
    pub payload: Data,
    /// When the event happened upstream
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event with no entity, stamped now
    pub fn new(event_type: EventType, payload: Data) -> Self {
        Self {
            event_type,
            entity_id: None,
            room_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Attach an entity id
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Attach a room id
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Entity id, treating the empty string as absent
    pub fn entity(&self) -> Option<&str> {
        self.entity_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Room id, treating the empty string as absent
    pub fn room(&self) -> Option<&str> {
        self.room_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Wire form of this event
    ///
    /// `entity_id` and `room_id` are copied into `data` unless the payload
    /// already carries them.
    pub fn to_envelope(&self) -> Envelope {
        let mut data = self.payload.clone();
        if let Some(entity) = self.entity() {
            data.entry("entity_id")
                .or_insert_with(|| Value::from(entity));
        }
        if let Some(room) = self.room() {
            data.insert("room_id".into(), Value::from(room));
        }
        Envelope::new(self.event_type.as_str(), data).with_timestamp(self.timestamp)
    }
}
