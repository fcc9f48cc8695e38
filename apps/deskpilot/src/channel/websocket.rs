use std::sync::Arc;

use deskpilot_bus::relay::{ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use super::{Channel, ChannelError, ChannelEvent, EventHub, Subscription};
use crate::protocol::PresencePayload;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel backed by a relay server websocket.
pub struct WebSocketChannel {
    member_id: String,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    hub: Arc<EventHub>,
    writer: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
}

impl WebSocketChannel {
    pub async fn connect(url: &Url) -> Result<Self, ChannelError> {
        let (mut socket, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| ChannelError::Connect(format!("timed out connecting to {url}")))?
            .map_err(|err| ChannelError::Connect(err.to_string()))?;

        let member_id = timeout(CONNECT_TIMEOUT, wait_for_join(&mut socket))
            .await
            .map_err(|_| ChannelError::Connect("relay never acknowledged the join".into()))??;
        debug!(%url, %member_id, "joined relay channel");

        let hub = EventHub::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (sink, stream) = socket.split();

        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&hub)));

        Ok(Self {
            member_id,
            outbound: Some(outbound),
            hub,
            writer: Some(writer),
            reader,
        })
    }

    /// Flushes queued frames, then closes the socket.
    pub async fn close(mut self) {
        self.outbound.take();
        if let Some(mut writer) = self.writer.take() {
            if timeout(CONNECT_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }

    fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        if self.hub.is_closed() {
            return Err(ChannelError::Disconnected);
        }
        self.outbound
            .as_ref()
            .ok_or(ChannelError::Disconnected)?
            .send(frame)
            .map_err(|_| ChannelError::Disconnected)
    }
}

impl Channel for WebSocketChannel {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn publish(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.send(ClientFrame::Broadcast {
            event: event.to_string(),
            payload,
        })
    }

    fn track(&self, presence: &PresencePayload) -> Result<(), ChannelError> {
        self.send(ClientFrame::Track {
            presence: presence.to_value(),
        })
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let Some(writer) = &self.writer {
            writer.abort();
        }
        self.reader.abort();
    }
}

async fn wait_for_join(socket: &mut Socket) -> Result<String, ChannelError> {
    while let Some(message) = socket.next().await {
        let message = message.map_err(|err| ChannelError::Connect(err.to_string()))?;
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Joined { member_id }) => return Ok(member_id),
            Ok(ServerFrame::Error { message }) => return Err(ChannelError::Connect(message)),
            Ok(_) => {}
            Err(err) => return Err(ChannelError::Protocol(err.to_string())),
        }
    }
    Err(ChannelError::Disconnected)
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
) {
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = heartbeat.tick() => ClientFrame::Ping,
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode client frame");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: futures_util::stream::SplitStream<Socket>, hub: Arc<EventHub>) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(error = %err, "relay socket error");
                break;
            }
        };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Broadcast {
                from,
                event,
                payload,
            }) => hub.emit(ChannelEvent::Broadcast {
                from,
                event,
                payload,
            }),
            Ok(ServerFrame::PresenceSync { members }) => {
                hub.emit(ChannelEvent::PresenceSync(members))
            }
            Ok(ServerFrame::Error { message }) => warn!(%message, "relay reported an error"),
            Ok(ServerFrame::Pong) | Ok(ServerFrame::Joined { .. }) => {}
            Err(err) => trace!(error = %err, "ignoring unparseable relay frame"),
        }
    }
    hub.emit(ChannelEvent::Closed);
}
