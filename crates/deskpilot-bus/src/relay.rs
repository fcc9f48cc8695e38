//! Frames exchanged between relay clients and the relay server over a
//! machine's websocket channel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BusError, BusResult, Member};

/// Event discriminator for commands, screenshot requests and responses.
pub const EVENT_COMMAND: &str = "command";
/// Event discriminator the relay emits after a successful claim.
pub const EVENT_SESSION_CLAIMED: &str = "session_claimed";
/// Sender id used for broadcasts originating from the relay itself.
pub const RELAY_SENDER: &str = "relay";

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start or update presence tracking for this connection.
    Track { presence: Value },
    /// Fan out to every other connection on the channel.
    Broadcast { event: String, payload: Value },
    Ping,
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Joined {
        member_id: String,
    },
    Broadcast {
        from: String,
        event: String,
        payload: Value,
    },
    PresenceSync {
        members: Vec<Member>,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Broadcast as carried on the bus between relay connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayEnvelope {
    pub from: String,
    pub event: String,
    pub payload: Value,
}

impl RelayEnvelope {
    pub fn new(from: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            from: from.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn encode(&self) -> BusResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| BusError::Transport(format!("encode envelope: {err}")))
    }

    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| BusError::Transport(format!("decode envelope: {err}")))
    }

    pub fn into_frame(self) -> ServerFrame {
        ServerFrame::Broadcast {
            from: self.from,
            event: self.event,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn client_frames_use_snake_case_tags() {
        let frame = ClientFrame::Broadcast {
            event: EVENT_COMMAND.into(),
            payload: json!({"type": "click", "button": "left"}),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "broadcast");
        assert_eq!(value["event"], "command");
        assert_eq!(value["payload"]["type"], "click");

        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientFrame::Ping);
    }

    #[test_timeout::timeout]
    fn presence_sync_decodes_member_meta() {
        let raw = r#"{"type":"presence_sync","members":[{"id":"a","meta":{"role":"agent"}}]}"#;
        let frame: ServerFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ServerFrame::PresenceSync { members } => {
                assert_eq!(members[0].id, "a");
                assert_eq!(members[0].meta["role"], "agent");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn envelope_becomes_broadcast_frame() {
        let envelope = RelayEnvelope::new(RELAY_SENDER, EVENT_SESSION_CLAIMED, json!({"owner_id": "u-1"}));
        let decoded = RelayEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(matches!(
            decoded.into_frame(),
            ServerFrame::Broadcast { ref from, ref event, .. } if from == "relay" && event == "session_claimed"
        ));
        assert!(RelayEnvelope::decode(b"not json").is_err());
    }
}
