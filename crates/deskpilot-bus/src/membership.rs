use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::BusResult;

/// One tracked connection on a topic. `meta` is opaque to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl Member {
    pub fn new(id: impl Into<String>, meta: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            meta,
        }
    }
}

/// Full membership snapshot emitted after every join, update or leave.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipSync {
    pub topic: String,
    pub members: Vec<Member>,
}

/// Presence tracking attached to a bus. Consumers always receive the whole
/// snapshot, never deltas.
pub trait Membership: Send + Sync {
    /// Adds `member`, or replaces the meta of an existing member with the same id.
    fn track(&self, topic: &str, member: Member) -> BusResult<()>;
    fn untrack(&self, topic: &str, member_id: &str);
    fn members(&self, topic: &str) -> Vec<Member>;
    fn watch(&self, topic: &str) -> broadcast::Receiver<MembershipSync>;
}
