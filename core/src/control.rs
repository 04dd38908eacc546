//! Inbound control messages
//!
//! Clients steer their own subscriptions with control envelopes. Two naming
//! families are accepted for the filter messages (`subscribe_event_types`
//! and `subscribe_ha_events` mean the same thing).

use crate::error::ProtocolError;
use crate::message::Envelope;
use serde_json::Value;

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Join hub topics; with no topics, opt into state changes
    Subscribe {
        /// Topics named in `data.topics`
        topics: Vec<String>,
    },
    /// Join the `room:<id>` topic
    SubscribeRoom(String),
    /// Leave the `room:<id>` topic
    UnsubscribeRoom(String),
    /// Opt into event types (names are validated by the receiver)
    SubscribeEventTypes(Vec<String>),
    /// Opt out of event types
    UnsubscribeEventTypes(Vec<String>),
    /// Narrow the entity filter to these ids
    SubscribeEntities(Vec<String>),
    /// Remove ids from the entity filter
    UnsubscribeEntities(Vec<String>),
    /// Narrow the room filter to these ids
    SubscribeRooms(Vec<String>),
    /// Remove ids from the room filter
    UnsubscribeRooms(Vec<String>),
    /// Application-level ping
    Ping,
}

impl ControlMessage {
    /// Decode a control message from an inbound envelope
    pub fn parse(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope.message_type.as_str();
        let msg = match kind {
            "ping" => ControlMessage::Ping,
            "subscribe" => ControlMessage::Subscribe {
                topics: optional_list(envelope, "topics")?,
            },
            "subscribe_room" => ControlMessage::SubscribeRoom(id_field(envelope, "room_id")?),
            "unsubscribe_room" => ControlMessage::UnsubscribeRoom(id_field(envelope, "room_id")?),
            "subscribe_event_types" | "subscribe_ha_events" => {
                ControlMessage::SubscribeEventTypes(list(envelope, "event_types")?)
            }
            "unsubscribe_event_types" | "unsubscribe_ha_events" => {
                ControlMessage::UnsubscribeEventTypes(list(envelope, "event_types")?)
            }
            "subscribe_entities" | "subscribe_ha_entities" => {
                ControlMessage::SubscribeEntities(list(envelope, "entity_ids")?)
            }
            "unsubscribe_entities" | "unsubscribe_ha_entities" => {
                ControlMessage::UnsubscribeEntities(list(envelope, "entity_ids")?)
            }
            "subscribe_rooms" | "subscribe_ha_rooms" => {
                ControlMessage::SubscribeRooms(list(envelope, "room_ids")?)
            }
            "unsubscribe_rooms" | "unsubscribe_ha_rooms" => {
                ControlMessage::UnsubscribeRooms(list(envelope, "room_ids")?)
            }
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(msg)
    }

    /// Canonical name, used as a metrics label
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Subscribe { .. } => "subscribe",
            ControlMessage::SubscribeRoom(_) => "subscribe_room",
            ControlMessage::UnsubscribeRoom(_) => "unsubscribe_room",
            ControlMessage::SubscribeEventTypes(_) => "subscribe_event_types",
            ControlMessage::UnsubscribeEventTypes(_) => "unsubscribe_event_types",
            ControlMessage::SubscribeEntities(_) => "subscribe_entities",
            ControlMessage::UnsubscribeEntities(_) => "unsubscribe_entities",
            ControlMessage::SubscribeRooms(_) => "subscribe_rooms",
            ControlMessage::UnsubscribeRooms(_) => "unsubscribe_rooms",
            ControlMessage::Ping => "ping",
        }
    }
}

/// Identifiers may arrive as strings or numbers (room ids often do)
fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id_field(envelope: &Envelope, field: &'static str) -> Result<String, ProtocolError> {
    let value = envelope
        .data
        .get(field)
        .ok_or_else(|| ProtocolError::MissingField {
            message_type: envelope.message_type.clone(),
            field,
        })?;
    id_value(value).ok_or_else(|| ProtocolError::InvalidField {
        message_type: envelope.message_type.clone(),
        field,
    })
}

fn list(envelope: &Envelope, field: &'static str) -> Result<Vec<String>, ProtocolError> {
    match envelope.data.get(field) {
        Some(value) => decode_list(envelope, field, value),
        None => Err(ProtocolError::MissingField {
            message_type: envelope.message_type.clone(),
            field,
        }),
    }
}

fn optional_list(envelope: &Envelope, field: &'static str) -> Result<Vec<String>, ProtocolError> {
    match envelope.data.get(field) {
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(value) => decode_list(envelope, field, value),
    }
}

fn decode_list(
    envelope: &Envelope,
    field: &'static str,
    value: &Value,
) -> Result<Vec<String>, ProtocolError> {
    let invalid = || ProtocolError::InvalidField {
        message_type: envelope.message_type.clone(),
        field,
    };
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|item| id_value(item).ok_or_else(invalid))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<ControlMessage, ProtocolError> {
        ControlMessage::parse(&Envelope::from_slice(raw.as_bytes()).unwrap())
    }

    #[test]
    fn both_naming_families_decode_the_same() {
        let a = parse(r#"{"type":"subscribe_ha_events","data":{"event_types":["state_changed"]}}"#)
            .unwrap();
        let b =
            parse(r#"{"type":"subscribe_event_types","data":{"event_types":["state_changed"]}}"#)
                .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name(), "subscribe_event_types");
    }

    #[test]
    fn room_ids_accept_numbers() {
        let msg = parse(r#"{"type":"subscribe_room","data":{"room_id":7}}"#).unwrap();
        assert_eq!(msg, ControlMessage::SubscribeRoom("7".into()));

        let msg = parse(r#"{"type":"subscribe_ha_rooms","data":{"room_ids":[1,"patio"]}}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::SubscribeRooms(vec!["1".into(), "patio".into()])
        );
    }

    #[test]
    fn subscribe_without_topics() {
        let msg = parse(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Subscribe { topics: vec![] });

        let msg = parse(r#"{"type":"subscribe","data":{"topics":["entity:light.kitchen"]}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ControlMessage::Subscribe {
                topics: vec!["entity:light.kitchen".into()]
            }
        );
    }

    #[test]
    fn missing_and_invalid_fields() {
        let err = parse(r#"{"type":"subscribe_entities","data":{}}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingField {
                field: "entity_ids",
                ..
            }
        ));

        let err = parse(r#"{"type":"subscribe_entities","data":{"entity_ids":"light.a"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { .. }));

        let err = parse(r#"{"type":"subscribe_room","data":{"room_id":""}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { .. }));
    }

    #[test]
    fn unknown_type() {
        let err = parse(r#"{"type":"reboot"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("reboot".into()));
    }

    #[test]
    fn ping() {
        assert_eq!(parse(r#"{"type":"ping"}"#).unwrap(), ControlMessage::Ping);
    }
}
