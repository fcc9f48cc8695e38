//! A machine's realtime channel as seen by one participant.
//!
//! Each process consumes events through a [`Subscription`] in a single
//! dispatch task. Presence arrives as full snapshots; a new subscription
//! starts with the latest snapshot so late subscribers never miss state.

pub mod local;
pub mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use deskpilot_bus::Member;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use crate::protocol::PresencePayload;

pub use local::LocalChannel;
pub use websocket::WebSocketChannel;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Broadcast {
        from: String,
        event: String,
        payload: Value,
    },
    PresenceSync(Vec<Member>),
    Closed,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel disconnected")]
    Disconnected,
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("channel protocol error: {0}")]
    Protocol(String),
}

pub trait Channel: Send + Sync {
    /// Id the relay assigned to this connection.
    fn member_id(&self) -> &str;

    /// Fire-and-forget broadcast to every other member.
    fn publish(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    /// Announces (or re-announces) this connection's presence.
    fn track(&self, presence: &PresencePayload) -> Result<(), ChannelError>;

    fn subscribe(&self) -> Subscription;
}

/// Fan-out point shared by a channel and its background tasks.
#[derive(Debug)]
pub(crate) struct EventHub {
    events: broadcast::Sender<ChannelEvent>,
    latest_presence: Mutex<Option<Vec<Member>>>,
    closed: AtomicBool,
}

impl EventHub {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            events: broadcast::channel(EVENT_CAPACITY).0,
            latest_presence: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        match &event {
            ChannelEvent::PresenceSync(members) => {
                *self.latest_presence.lock() = Some(members.clone());
            }
            ChannelEvent::Closed => {
                if self.closed.swap(true, Ordering::SeqCst) {
                    return;
                }
            }
            ChannelEvent::Broadcast { .. } => {}
        }
        let _ = self.events.send(event);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription {
        let rx = self.events.subscribe();
        let closed = self.is_closed();
        Subscription {
            rx,
            hub: Arc::clone(self),
            pending: if closed {
                None
            } else {
                self.latest_presence.lock().clone()
            },
            closed_seen: closed,
        }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<ChannelEvent>,
    hub: Arc<EventHub>,
    pending: Option<Vec<Member>>,
    closed_seen: bool,
}

impl Subscription {
    /// Next event. After the channel closes this keeps returning `Closed`.
    pub async fn recv(&mut self) -> ChannelEvent {
        if let Some(members) = self.pending.take() {
            return ChannelEvent::PresenceSync(members);
        }
        if self.closed_seen {
            return ChannelEvent::Closed;
        }
        loop {
            match self.rx.recv().await {
                Ok(ChannelEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                    self.closed_seen = true;
                    return ChannelEvent::Closed;
                }
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "channel subscriber lagged");
                    if self.hub.is_closed() {
                        self.closed_seen = true;
                        return ChannelEvent::Closed;
                    }
                    if let Some(members) = self.hub.latest_presence.lock().clone() {
                        return ChannelEvent::PresenceSync(members);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::tokio_timeout_test]
    async fn late_subscribers_start_from_the_latest_snapshot() {
        let hub = EventHub::new();
        hub.emit(ChannelEvent::PresenceSync(vec![Member::new(
            "a",
            json!({"role": "agent"}),
        )]));

        let mut sub = hub.subscribe();
        match sub.recv().await {
            ChannelEvent::PresenceSync(members) => assert_eq!(members[0].id, "a"),
            other => panic!("unexpected event {other:?}"),
        }

        hub.emit(ChannelEvent::Broadcast {
            from: "c".into(),
            event: "command".into(),
            payload: json!({"type": "wait"}),
        });
        assert!(matches!(sub.recv().await, ChannelEvent::Broadcast { .. }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_is_sticky() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        hub.emit(ChannelEvent::Closed);
        hub.emit(ChannelEvent::Closed);
        assert_eq!(sub.recv().await, ChannelEvent::Closed);
        assert_eq!(sub.recv().await, ChannelEvent::Closed);
        assert!(hub.is_closed());
    }
}
