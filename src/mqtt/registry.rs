//! Topic registry
//!
//! Holds the coordinator's best knowledge of which topics the broker has us
//! subscribed to. Only acknowledgements mutate it, and it survives connection
//! loss so the set can be replayed after a reconnect.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Known to the registry but not yet acknowledged by a broker
    Pending,
    Subscribed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicRegistry {
    entries: BTreeMap<String, SubscriptionStatus>,
}

impl TopicRegistry {
    /// Builds a registry whose topics are all pending
    pub fn seeded<I, T>(topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let entries = topics
            .into_iter()
            .map(|topic| (topic.into(), SubscriptionStatus::Pending))
            .collect();
        Self { entries }
    }

    /// Records a subscribe acknowledgement. Repeated acks keep a single entry.
    pub fn mark_subscribed(&mut self, topic: &str) {
        match self.entries.get_mut(topic) {
            Some(status) => *status = SubscriptionStatus::Subscribed,
            None => {
                self.entries
                    .insert(topic.to_string(), SubscriptionStatus::Subscribed);
            }
        }
    }

    /// Records an unsubscribe acknowledgement. Returns whether an entry existed.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.entries.remove(topic).is_some()
    }

    pub fn status(&self, topic: &str) -> Option<SubscriptionStatus> {
        self.entries.get(topic).copied()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    /// Owned copy of the current topic names, safe to iterate while the
    /// registry keeps changing
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> &BTreeMap<String, SubscriptionStatus> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
