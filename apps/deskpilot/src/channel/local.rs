use std::sync::Arc;

use deskpilot_bus::relay::RelayEnvelope;
use deskpilot_bus::{Bus, LocalBus, Member, Membership, machine_topic};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{trace, warn};
use uuid::Uuid;

use super::{Channel, ChannelError, ChannelEvent, EventHub, Subscription};
use crate::protocol::PresencePayload;

/// In-process channel over a shared [`LocalBus`], with the same semantics as
/// a relay connection.
pub struct LocalChannel {
    bus: Arc<LocalBus>,
    topic: String,
    member_id: String,
    hub: Arc<EventHub>,
    pump: JoinHandle<()>,
}

impl LocalChannel {
    /// Must be called from within a tokio runtime.
    pub fn join(bus: Arc<LocalBus>, machine_id: &str) -> Self {
        let topic = machine_topic(machine_id);
        let member_id = Uuid::new_v4().to_string();
        let hub = EventHub::new();
        let messages = bus.subscribe(&topic);
        let presence = bus.watch(&topic);
        hub.emit(ChannelEvent::PresenceSync(bus.members(&topic)));
        let pump = tokio::spawn(pump(
            messages,
            presence,
            member_id.clone(),
            Arc::clone(&hub),
        ));
        Self {
            bus,
            topic,
            member_id,
            hub,
            pump,
        }
    }

    /// Leaves the channel as if the connection dropped.
    pub fn close(&self) {
        self.pump.abort();
        self.bus.untrack(&self.topic, &self.member_id);
        self.hub.emit(ChannelEvent::Closed);
    }
}

impl Channel for LocalChannel {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn publish(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        if self.hub.is_closed() {
            return Err(ChannelError::Disconnected);
        }
        let bytes = RelayEnvelope::new(self.member_id.clone(), event, payload)
            .encode()
            .map_err(|err| ChannelError::Protocol(err.to_string()))?;
        self.bus
            .publish(&self.topic, bytes)
            .map_err(|_| ChannelError::Disconnected)
    }

    fn track(&self, presence: &PresencePayload) -> Result<(), ChannelError> {
        if self.hub.is_closed() {
            return Err(ChannelError::Disconnected);
        }
        self.bus
            .track(
                &self.topic,
                Member::new(self.member_id.clone(), presence.to_value()),
            )
            .map_err(|_| ChannelError::Disconnected)
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.pump.abort();
        self.bus.untrack(&self.topic, &self.member_id);
    }
}

async fn pump(
    mut messages: tokio::sync::broadcast::Receiver<deskpilot_bus::BusMessage>,
    mut presence: tokio::sync::broadcast::Receiver<deskpilot_bus::MembershipSync>,
    member_id: String,
    hub: Arc<EventHub>,
) {
    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Ok(message) => {
                    let envelope = match RelayEnvelope::decode(&message.payload) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            warn!(error = %err, "dropping undecodable bus message");
                            continue;
                        }
                    };
                    if envelope.from == member_id {
                        continue;
                    }
                    hub.emit(ChannelEvent::Broadcast {
                        from: envelope.from,
                        event: envelope.event,
                        payload: envelope.payload,
                    });
                }
                Err(RecvError::Lagged(skipped)) => trace!(skipped, "local channel lagged"),
                Err(RecvError::Closed) => break,
            },
            sync = presence.recv() => match sync {
                Ok(sync) => hub.emit(ChannelEvent::PresenceSync(sync.members)),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
    hub.emit(ChannelEvent::Closed);
}
