use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use deskpilot_bus::relay::{
    ClientFrame, RelayEnvelope, ServerFrame, EVENT_SESSION_CLAIMED, RELAY_SENDER,
};
use deskpilot_bus::{
    machine_topic, Bus, BusMessage, BusResult, LocalBus, Member, Membership, MembershipSync,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{metrics, AppState};

/// Per-machine channels: broadcast fan-out plus presence, both on one bus.
#[derive(Clone)]
pub struct RelayState {
    bus: Arc<LocalBus>,
    idle_timeout: Duration,
}

impl RelayState {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            bus: Arc::new(LocalBus::new()),
            idle_timeout,
        }
    }

    /// Machine channels with state still held on the bus.
    pub fn open_channels(&self) -> usize {
        self.bus.topic_count()
    }

    pub fn members(&self, machine_id: &str) -> Vec<Member> {
        self.bus.members(&machine_topic(machine_id))
    }

    /// Tells everyone on the machine's channel (the agent in particular)
    /// that the session now has an owner.
    pub fn notify_claimed(&self, machine_id: &str, owner_id: &str) -> BusResult<()> {
        let envelope = RelayEnvelope::new(
            RELAY_SENDER,
            EVENT_SESSION_CLAIMED,
            json!({ "owner_id": owner_id }),
        );
        self.bus
            .publish(&machine_topic(machine_id), envelope.encode()?)?;
        metrics::RELAYED
            .with_label_values(&[EVENT_SESSION_CLAIMED])
            .inc();
        Ok(())
    }

    fn publish_from(
        &self,
        topic: &str,
        member_id: &str,
        event: String,
        payload: serde_json::Value,
    ) -> BusResult<()> {
        let envelope = RelayEnvelope::new(member_id, event, payload);
        self.bus.publish(topic, envelope.encode()?)?;
        metrics::RELAYED
            .with_label_values(&[envelope.event.as_str()])
            .inc();
        Ok(())
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(machine_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, machine_id, state.relay))
}

async fn handle_socket(socket: WebSocket, machine_id: String, relay: RelayState) {
    let member_id = Uuid::new_v4().to_string();
    let topic = machine_topic(&machine_id);
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    metrics::CONNECTIONS.inc();

    let writer_member = member_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&frame) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(member = %writer_member, "relay writer ended");
    });

    // Subscribe before announcing so nothing published after the join is missed.
    let broadcasts = relay.bus.subscribe(&topic);
    let syncs = relay.bus.watch(&topic);
    let forwarder = tokio::spawn(forward_channel(
        relay.clone(),
        topic.clone(),
        member_id.clone(),
        (broadcasts, syncs),
        tx.clone(),
    ));

    let _ = tx.send(ServerFrame::Joined {
        member_id: member_id.clone(),
    });
    let _ = tx.send(ServerFrame::PresenceSync {
        members: relay.bus.members(&topic),
    });
    info!(%machine_id, member = %member_id, "relay connection opened");

    loop {
        let next = match tokio::time::timeout(relay.idle_timeout, receiver.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(%machine_id, member = %member_id, "closing idle relay connection");
                break;
            }
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                debug!(member = %member_id, error = %err, "websocket error");
                break;
            }
            None => break,
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(member = %member_id, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => handle_client_frame(frame, &relay, &topic, &member_id, &tx),
            Err(err) => {
                warn!(member = %member_id, error = %err, "invalid relay frame");
                let _ = tx.send(ServerFrame::Error {
                    message: format!("invalid frame: {err}"),
                });
            }
        }
    }

    relay.bus.untrack(&topic, &member_id);
    metrics::PRESENCE_CHANGES
        .with_label_values(&["untrack"])
        .inc();
    metrics::CONNECTIONS.dec();
    forwarder.abort();
    let _ = forwarder.await;
    relay.bus.release(&topic);
    drop(tx);
    let _ = writer.await;
    info!(%machine_id, member = %member_id, "relay connection closed");
}

fn handle_client_frame(
    frame: ClientFrame,
    relay: &RelayState,
    topic: &str,
    member_id: &str,
    tx: &mpsc::UnboundedSender<ServerFrame>,
) {
    match frame {
        ClientFrame::Track { presence } => {
            debug!(member = %member_id, ?presence, "tracking presence");
            if let Err(err) = relay.bus.track(topic, Member::new(member_id, presence)) {
                let _ = tx.send(ServerFrame::Error {
                    message: err.to_string(),
                });
                return;
            }
            metrics::PRESENCE_CHANGES.with_label_values(&["track"]).inc();
        }
        ClientFrame::Broadcast { event, .. } if event == EVENT_SESSION_CLAIMED => {
            warn!(member = %member_id, "rejecting client session_claimed broadcast");
            let _ = tx.send(ServerFrame::Error {
                message: format!("{EVENT_SESSION_CLAIMED} is reserved for the relay"),
            });
        }
        ClientFrame::Broadcast { event, payload } => {
            if let Err(err) = relay.publish_from(topic, member_id, event, payload) {
                warn!(member = %member_id, error = %err, "broadcast failed");
                let _ = tx.send(ServerFrame::Error {
                    message: err.to_string(),
                });
            }
        }
        ClientFrame::Ping => {
            let _ = tx.send(ServerFrame::Pong);
        }
    }
}

/// Feeds one connection with broadcasts from others and full presence snapshots.
async fn forward_channel(
    relay: RelayState,
    topic: String,
    member_id: String,
    (mut broadcasts, mut syncs): (
        broadcast::Receiver<BusMessage>,
        broadcast::Receiver<MembershipSync>,
    ),
    tx: mpsc::UnboundedSender<ServerFrame>,
) {
    loop {
        let frame = tokio::select! {
            msg = broadcasts.recv() => match msg {
                Ok(msg) => match RelayEnvelope::decode(&msg.payload) {
                    Ok(envelope) if envelope.from == member_id => continue,
                    Ok(envelope) => envelope.into_frame(),
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable broadcast");
                        continue;
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(member = %member_id, skipped, "relay subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            sync = syncs.recv() => match sync {
                Ok(sync) => ServerFrame::PresenceSync { members: sync.members },
                // Snapshots are idempotent; after a lag send the current one.
                Err(RecvError::Lagged(_)) => ServerFrame::PresenceSync {
                    members: relay.bus.members(&topic),
                },
                Err(RecvError::Closed) => break,
            },
        };
        if tx.send(frame).is_err() {
            break;
        }
    }
}
