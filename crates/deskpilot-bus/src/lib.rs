pub mod membership;
pub mod relay;

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

pub use membership::{Member, Membership, MembershipSync};

/// Broadcast backlog kept per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// Topic for everything exchanged about one machine.
pub fn machine_topic(machine_id: &str) -> String {
    format!("machine:{machine_id}")
}

#[derive(Debug)]
struct TopicMembers {
    members: Vec<Member>,
    sync_tx: broadcast::Sender<MembershipSync>,
}

impl Default for TopicMembers {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            sync_tx: broadcast::channel(TOPIC_CAPACITY).0,
        }
    }
}

/// In-memory bus used by the relay server and by in-process tests.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    presence: parking_lot::RwLock<HashMap<String, TopicMembers>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the topic's state once nobody listens on it or is present.
    /// Call after a subscriber goes away; topics still in use are kept.
    pub fn release(&self, topic: &str) {
        {
            let mut topics = self.topics.write();
            if topics
                .get(topic)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                topics.remove(topic);
            }
        }
        let mut presence = self.presence.write();
        if presence
            .get(topic)
            .is_some_and(|entry| entry.members.is_empty() && entry.sync_tx.receiver_count() == 0)
        {
            presence.remove(topic);
        }
    }

    /// Topics with broadcast or presence state still held.
    pub fn topic_count(&self) -> usize {
        let topics = self.topics.read();
        let presence = self.presence.read();
        topics.len() + presence.keys().filter(|topic| !topics.contains_key(*topic)).count()
    }

    /// Number of live subscribers on a topic, used for diagnostics.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        // Subscribe under the lock so a concurrent release cannot orphan us.
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.subscribe();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        // No subscribers is not an error: broadcasts are fire-and-forget.
        let Some(sender) = self.topics.read().get(topic).cloned() else {
            return Ok(());
        };
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

impl Membership for LocalBus {
    fn track(&self, topic: &str, member: Member) -> BusResult<()> {
        let mut guard = self.presence.write();
        let entry = guard.entry(topic.to_string()).or_default();
        match entry.members.iter_mut().find(|m| m.id == member.id) {
            Some(existing) => existing.meta = member.meta,
            None => entry.members.push(member),
        }
        let _ = entry.sync_tx.send(MembershipSync {
            topic: topic.to_string(),
            members: entry.members.clone(),
        });
        Ok(())
    }

    fn untrack(&self, topic: &str, member_id: &str) {
        let mut guard = self.presence.write();
        let Some(entry) = guard.get_mut(topic) else {
            return;
        };
        let before = entry.members.len();
        entry.members.retain(|m| m.id != member_id);
        if entry.members.len() == before {
            return;
        }
        let _ = entry.sync_tx.send(MembershipSync {
            topic: topic.to_string(),
            members: entry.members.clone(),
        });
        if entry.members.is_empty() && entry.sync_tx.receiver_count() == 0 {
            guard.remove(topic);
        }
    }

    fn members(&self, topic: &str) -> Vec<Member> {
        self.presence
            .read()
            .get(topic)
            .map(|entry| entry.members.clone())
            .unwrap_or_default()
    }

    fn watch(&self, topic: &str) -> broadcast::Receiver<MembershipSync> {
        let mut guard = self.presence.write();
        guard.entry(topic.to_string()).or_default().sync_tx.subscribe()
    }
}
