//! Topic → subscriber index.
//!
//! The router only stores [`ConnectionId`]s. Connection records, and the reverse
//! `subscribed_topics` set used for O(subscriptions) cleanup, live in the registry.

use std::collections::{HashMap, HashSet};

use crate::registry::{Connection, ConnectionId};

#[derive(Debug, Default)]
pub struct TopicRouter {
    topics: HashMap<String, HashSet<ConnectionId>>,
}

/// Recipients of one broadcast.
#[derive(Debug)]
pub enum Route<'a> {
    Topic(Option<&'a HashSet<ConnectionId>>),
    Everyone,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the connection was not yet subscribed.
    pub fn subscribe(&mut self, connection: ConnectionId, topic: &str) -> bool {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(connection)
    }

    /// Returns `true` when a subscription was removed. Empty topics are pruned.
    pub fn unsubscribe(&mut self, connection: ConnectionId, topic: &str) -> bool {
        let Some(members) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(&connection);
        if members.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    pub fn route(&self, topic: Option<&str>) -> Route<'_> {
        match topic {
            Some(topic) => Route::Topic(self.topics.get(topic)),
            None => Route::Everyone,
        }
    }

    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .get(topic)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, connection: ConnectionId, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|members| members.contains(&connection))
    }

    /// Purges the connection from every topic listed in its record.
    pub fn remove_connection(&mut self, connection: &Connection) {
        for topic in &connection.subscribed_topics {
            self.unsubscribe(connection.id, topic);
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
