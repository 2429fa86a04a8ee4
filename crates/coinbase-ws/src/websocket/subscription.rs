//! Desired-subscription bookkeeping for one connection.
//!
//! The set records what the caller wants to be subscribed to, independent of
//! whether a socket currently exists. It survives reconnects and is replayed
//! in registration order whenever the connection becomes ready.

use super::types::TopicRequest;

/// Insertion-ordered set of topic requests.
#[derive(Clone, Debug, Default)]
pub struct TopicSet {
    topics: Vec<TopicRequest>,
}

impl TopicSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a topic. Returns `true` if it was not already present.
    pub fn insert(&mut self, topic: TopicRequest) -> bool {
        if self.contains(&topic) {
            return false;
        }
        self.topics.push(topic);
        true
    }

    /// Remove a topic. Returns `true` if it was present.
    pub fn remove(&mut self, topic: &TopicRequest) -> bool {
        match self.topics.iter().position(|t| t == topic) {
            Some(index) => {
                self.topics.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, topic: &TopicRequest) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &TopicRequest> {
        self.topics.iter()
    }

    /// Snapshot of the topics in registration order.
    pub fn to_vec(&self) -> Vec<TopicRequest> {
        self.topics.clone()
    }

    /// Split into `(public, private)` using the given classifier, keeping
    /// registration order within each group.
    pub fn partition(
        &self,
        is_private: impl Fn(&TopicRequest) -> bool,
    ) -> (Vec<TopicRequest>, Vec<TopicRequest>) {
        let (private, public): (Vec<_>, Vec<_>) =
            self.topics.iter().cloned().partition(|t| is_private(t));
        (public, private)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
