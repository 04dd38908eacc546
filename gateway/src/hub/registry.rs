//! Client registry and topic index
//!
//! Mutated only by the hub control loop. Topic membership is by id; removing
//! a client removes every membership in the same call, so the index never
//! points at a client the registry no longer holds.

use crate::client::{Client, ClientId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct Registry {
    clients: HashMap<ClientId, Arc<Client>>,
    topics: HashMap<String, HashSet<ClientId>>,
    memberships: HashMap<ClientId, HashSet<String>>,
}

impl Registry {
    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Arc<Client>> {
        self.clients.get(id)
    }

    pub(crate) fn clients(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.clients.values()
    }

    pub(crate) fn insert(&mut self, client: Arc<Client>) {
        self.clients.insert(client.id().to_string(), client);
    }

    /// Remove a client and all of its topic memberships
    pub(crate) fn remove(&mut self, id: &str) -> Option<Arc<Client>> {
        let client = self.clients.remove(id)?;
        if let Some(topics) = self.memberships.remove(id) {
            for topic in topics {
                if let Some(members) = self.topics.get_mut(&topic) {
                    members.remove(id);
                    if members.is_empty() {
                        self.topics.remove(&topic);
                    }
                }
            }
        }
        Some(client)
    }

    /// Add a topic membership; ignored for unknown clients
    pub(crate) fn subscribe(&mut self, id: &str, topic: &str) -> bool {
        if !self.clients.contains_key(id) {
            return false;
        }
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(id.to_string());
        self.memberships
            .entry(id.to_string())
            .or_default()
            .insert(topic.to_string())
    }

    pub(crate) fn unsubscribe(&mut self, id: &str, topic: &str) -> bool {
        let removed = self
            .memberships
            .get_mut(id)
            .is_some_and(|topics| topics.remove(topic));
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(id);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
        removed
    }

    /// Members of `topic`
    pub(crate) fn topic_members(&self, topic: &str) -> Vec<Arc<Client>> {
        self.topics
            .get(topic)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.clients.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sorted topics of one client
    pub(crate) fn topics_of(&self, id: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .memberships
            .get(id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Member count per topic
    pub(crate) fn topic_sizes(&self) -> BTreeMap<String, usize> {
        self.topics
            .iter()
            .map(|(topic, ids)| (topic.clone(), ids.len()))
            .collect()
    }

    /// Remove and return every client
    pub(crate) fn drain(&mut self) -> Vec<Arc<Client>> {
        self.topics.clear();
        self.memberships.clear();
        self.clients.drain().map(|(_, c)| c).collect()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (topic, ids) in &self.topics {
            assert!(!ids.is_empty(), "empty topic {topic} left behind");
            for id in ids {
                assert!(self.clients.contains_key(id), "dangling member {id}");
                assert!(self.memberships[id].contains(topic));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, ClientMetadata};

    fn client() -> Arc<Client> {
        Client::new(&ClientConfig::default(), ClientMetadata::default(), false)
    }

    #[test]
    fn removal_drops_all_memberships() {
        let mut reg = Registry::default();
        let a = client();
        let b = client();
        reg.insert(Arc::clone(&a));
        reg.insert(Arc::clone(&b));

        assert!(reg.subscribe(a.id(), "room:1"));
        assert!(reg.subscribe(a.id(), "entity:light.kitchen"));
        assert!(reg.subscribe(b.id(), "room:1"));
        reg.assert_consistent();

        reg.remove(a.id()).unwrap();
        reg.assert_consistent();
        assert_eq!(reg.topic_count(), 1);
        assert_eq!(reg.topic_members("room:1").len(), 1);
        assert!(reg.topic_members("entity:light.kitchen").is_empty());
        assert!(reg.remove(a.id()).is_none());
    }

    #[test]
    fn unknown_clients_cannot_subscribe() {
        let mut reg = Registry::default();
        assert!(!reg.subscribe("ghost", "room:1"));
        assert_eq!(reg.topic_count(), 0);
    }

    #[test]
    fn unsubscribe_cleans_empty_topics() {
        let mut reg = Registry::default();
        let a = client();
        reg.insert(Arc::clone(&a));
        reg.subscribe(a.id(), "room:1");
        assert!(reg.unsubscribe(a.id(), "room:1"));
        assert!(!reg.unsubscribe(a.id(), "room:1"));
        assert_eq!(reg.topic_count(), 0);
        assert!(reg.topics_of(a.id()).is_empty());
        reg.assert_consistent();
    }
}
