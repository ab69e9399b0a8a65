//! Topic subscriptions multiplexed over one broker connection.
//!
//! Each topic holds a single broker-level subscription id and any number of
//! local handlers. The broker sees SUBSCRIBE when the first handler joins a
//! topic and UNSUBSCRIBE when the last one leaves.

use std::collections::HashMap;
use std::sync::Arc;

use taskflow_proto::stomp::Frame;
use taskflow_proto::topic::Topic;

use super::Handler;

/// Identifies one handler registration. Returned by
/// [`RealtimeBridge::subscribe`](super::RealtimeBridge::subscribe).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: Topic,
    id: u64,
}

impl SubscriptionHandle {
    /// Topic the handler listens on.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }
}

struct TopicEntry {
    subscription_id: String,
    handlers: Vec<(u64, Handler)>,
}

#[derive(Default)]
pub(crate) struct Registry {
    topics: HashMap<Topic, TopicEntry>,
    next_handler: u64,
    next_subscription: u64,
}

impl Registry {
    /// Register `handler` on `topic`. Returns the handle and, for the first
    /// handler on the topic, the SUBSCRIBE frame to send.
    ///
    /// Registering the same handler twice returns the existing handle.
    pub(crate) fn add(&mut self, topic: &Topic, handler: Handler) -> (SubscriptionHandle, Option<Frame>) {
        if let Some(entry) = self.topics.get_mut(topic) {
            if let Some((id, _)) = entry.handlers.iter().find(|(_, h)| Arc::ptr_eq(h, &handler)) {
                return (
                    SubscriptionHandle {
                        topic: topic.clone(),
                        id: *id,
                    },
                    None,
                );
            }
            self.next_handler += 1;
            entry.handlers.push((self.next_handler, handler));
            return (
                SubscriptionHandle {
                    topic: topic.clone(),
                    id: self.next_handler,
                },
                None,
            );
        }

        self.next_handler += 1;
        self.next_subscription += 1;
        let subscription_id = format!("sub-{}", self.next_subscription);
        let frame = Frame::subscribe(&subscription_id, &topic.destination());
        self.topics.insert(
            topic.clone(),
            TopicEntry {
                subscription_id,
                handlers: vec![(self.next_handler, handler)],
            },
        );
        (
            SubscriptionHandle {
                topic: topic.clone(),
                id: self.next_handler,
            },
            Some(frame),
        )
    }

    /// Drop one handler. Returns UNSUBSCRIBE when it was the topic's last.
    pub(crate) fn remove(&mut self, handle: &SubscriptionHandle) -> Option<Frame> {
        let entry = self.topics.get_mut(&handle.topic)?;
        entry.handlers.retain(|(id, _)| *id != handle.id);
        if entry.handlers.is_empty() {
            self.remove_topic(&handle.topic)
        } else {
            None
        }
    }

    /// Drop every handler on `topic`.
    pub(crate) fn remove_topic(&mut self, topic: &Topic) -> Option<Frame> {
        self.topics
            .remove(topic)
            .map(|entry| Frame::unsubscribe(&entry.subscription_id))
    }

    /// Handlers for an incoming MESSAGE, matched by subscription id with the
    /// destination as fallback.
    pub(crate) fn route(&self, subscription: Option<&str>, destination: Option<&str>) -> Option<(Topic, Vec<Handler>)> {
        let by_id = subscription.and_then(|sub| {
            self.topics
                .iter()
                .find(|(_, e)| e.subscription_id == sub)
        });
        let found = by_id.or_else(|| {
            let topic = Topic::parse(destination?);
            self.topics.get_key_value(&topic)
        })?;
        let (topic, entry) = found;
        Some((
            topic.clone(),
            entry.handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
        ))
    }

    pub(crate) fn clear(&mut self) {
        self.topics.clear();
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub(crate) fn handler_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map_or(0, |e| e.handlers.len())
    }

    pub(crate) fn contains(&self, handle: &SubscriptionHandle) -> bool {
        self.topics
            .get(&handle.topic)
            .is_some_and(|e| e.handlers.iter().any(|(id, _)| *id == handle.id))
    }
}
