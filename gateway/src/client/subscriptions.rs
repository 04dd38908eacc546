//! Per-client subscription state
//!
//! Event types are opt-in: a fresh client receives no domain events until it
//! subscribes to at least one type. Entity and room filters start out
//! permissive and narrow to an allow-list once ids are added.

use hearth_core::{Event, EventType};
use std::collections::{BTreeSet, HashSet};

/// Entity or room filter
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    /// No filter configured; everything matches
    #[default]
    AllowAll,
    /// Only these ids match; never empty
    AllowSet(HashSet<String>),
}

impl Scope {
    /// Whether `id` passes the filter
    pub fn allows(&self, id: &str) -> bool {
        match self {
            Scope::AllowAll => true,
            Scope::AllowSet(ids) => ids.contains(id),
        }
    }

    /// Add ids to the allow-list, switching from `AllowAll` if needed
    pub fn allow<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut ids = ids.into_iter().filter(|id| !id.is_empty()).peekable();
        if ids.peek().is_none() {
            return;
        }
        match self {
            Scope::AllowAll => *self = Scope::AllowSet(ids.collect()),
            Scope::AllowSet(set) => set.extend(ids),
        }
    }

    /// Remove ids; an allow-list that becomes empty reverts to `AllowAll`
    pub fn disallow<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        if let Scope::AllowSet(set) = self {
            for id in ids {
                set.remove(id);
            }
            if set.is_empty() {
                *self = Scope::AllowAll;
            }
        }
    }

    /// Sorted allow-list, or `None` for `AllowAll`
    pub fn ids(&self) -> Option<Vec<String>> {
        match self {
            Scope::AllowAll => None,
            Scope::AllowSet(set) => {
                let sorted: BTreeSet<_> = set.iter().cloned().collect();
                Some(sorted.into_iter().collect())
            }
        }
    }
}

/// Everything one client has asked to receive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    event_types: HashSet<EventType>,
    entities: Scope,
    rooms: Scope,
}

impl Subscriptions {
    /// Opt into event types
    pub fn subscribe_event_types<I>(&mut self, types: I)
    where
        I: IntoIterator<Item = EventType>,
    {
        self.event_types.extend(types);
    }

    /// Opt out of event types
    pub fn unsubscribe_event_types<I>(&mut self, types: I)
    where
        I: IntoIterator<Item = EventType>,
    {
        for t in types {
            self.event_types.remove(&t);
        }
    }

    /// Narrow the entity filter
    pub fn subscribe_entities<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.entities.allow(ids);
    }

    /// Widen the entity filter
    pub fn unsubscribe_entities<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.entities.disallow(ids);
    }

    /// Narrow the room filter
    pub fn subscribe_rooms<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.rooms.allow(ids);
    }

    /// Widen the room filter
    pub fn unsubscribe_rooms<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.rooms.disallow(ids);
    }

    /// Whether the client opted into `event_type`
    pub fn is_subscribed_to_event(&self, event_type: EventType) -> bool {
        self.event_types.contains(&event_type)
    }

    /// Whether the entity filter admits `entity_id`
    pub fn is_subscribed_to_entity(&self, entity_id: &str) -> bool {
        self.entities.allows(entity_id)
    }

    /// Whether the room filter admits `room_id`
    pub fn is_subscribed_to_room(&self, room_id: &str) -> bool {
        self.rooms.allows(room_id)
    }

    /// Event type AND entity AND room
    ///
    /// An event without an entity skips the entity check; an event whose
    /// room is unknown skips the room check.
    pub fn matches(&self, event: &Event) -> bool {
        self.is_subscribed_to_event(event.event_type)
            && event
                .entity()
                .is_none_or(|entity| self.is_subscribed_to_entity(entity))
            && event
                .room()
                .is_none_or(|room| self.is_subscribed_to_room(room))
    }

    /// Whether any event type is enabled
    pub fn has_event_types(&self) -> bool {
        !self.event_types.is_empty()
    }

    /// Subscribed event types, in declaration order
    pub fn event_types(&self) -> Vec<EventType> {
        EventType::ALL
            .into_iter()
            .filter(|t| self.event_types.contains(t))
            .collect()
    }

    /// Entity filter
    pub fn entities(&self) -> &Scope {
        &self.entities
    }

    /// Room filter
    pub fn rooms(&self) -> &Scope {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::Data;

    fn event(entity: Option<&str>, room: Option<&str>) -> Event {
        let mut event = Event::new(EventType::StateChanged, Data::new());
        event.entity_id = entity.map(str::to_string);
        event.room_id = room.map(str::to_string);
        event
    }

    fn subscribed() -> Subscriptions {
        let mut subs = Subscriptions::default();
        subs.subscribe_event_types([EventType::StateChanged]);
        subs
    }

    #[test]
    fn fresh_client_receives_nothing() {
        let subs = Subscriptions::default();
        assert!(!subs.matches(&event(Some("light.kitchen"), None)));
        assert!(subs.is_subscribed_to_entity("anything"));
        assert!(subs.is_subscribed_to_room("anywhere"));
    }

    #[test]
    fn scope_reverts_to_allow_all_when_emptied() {
        let mut scope = Scope::default();
        scope.allow(["a".to_string(), "b".to_string()]);
        assert!(!scope.allows("c"));
        scope.disallow(["a"]);
        assert_eq!(scope.ids(), Some(vec!["b".to_string()]));
        scope.disallow(["b"]);
        assert_eq!(scope, Scope::AllowAll);
        assert!(scope.allows("c"));
    }

    #[test]
    fn allowing_nothing_keeps_allow_all() {
        let mut scope = Scope::default();
        scope.allow(Vec::<String>::new());
        scope.allow([String::new()]);
        assert_eq!(scope, Scope::AllowAll);
    }

    #[test]
    fn filter_is_a_conjunction() {
        let target = event(Some("light.kitchen"), Some("kitchen"));

        let mut subs = subscribed();
        subs.subscribe_entities(["light.kitchen".to_string()]);
        subs.subscribe_rooms(["kitchen".to_string()]);
        assert!(subs.matches(&target));

        // Each condition on its own flips the result
        let mut no_type = subs.clone();
        no_type.unsubscribe_event_types([EventType::StateChanged]);
        assert!(!no_type.matches(&target));

        let mut other_entity = subscribed();
        other_entity.subscribe_entities(["switch.fan".to_string()]);
        other_entity.subscribe_rooms(["kitchen".to_string()]);
        assert!(!other_entity.matches(&target));

        let mut other_room = subscribed();
        other_room.subscribe_entities(["light.kitchen".to_string()]);
        other_room.subscribe_rooms(["garage".to_string()]);
        assert!(!other_room.matches(&target));
    }

    #[test]
    fn missing_entity_or_room_skips_that_check() {
        let mut subs = subscribed();
        subs.subscribe_entities(["light.kitchen".to_string()]);
        subs.subscribe_rooms(["kitchen".to_string()]);

        assert!(subs.matches(&event(None, None)));
        assert!(subs.matches(&event(Some("light.kitchen"), None)));
        assert!(!subs.matches(&event(Some("switch.fan"), None)));
        assert!(!subs.matches(&event(None, Some("garage"))));
    }

    #[test]
    fn event_types_listed_in_declaration_order() {
        let mut subs = Subscriptions::default();
        subs.subscribe_event_types([EventType::SyncStatus, EventType::StateChanged]);
        assert_eq!(
            subs.event_types(),
            vec![EventType::StateChanged, EventType::SyncStatus]
        );
    }
}
