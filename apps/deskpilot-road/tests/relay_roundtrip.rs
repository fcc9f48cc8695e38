use std::time::Duration;

use deskpilot_bus::relay::{ClientFrame, ServerFrame};
use deskpilot_road::{relay::RelayState, router, storage::InMemorySessionStore, AppState};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> String {
    spawn_server_with_relay().await.0
}

async fn spawn_server_with_relay() -> (String, RelayState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(InMemorySessionStore::new(), Duration::from_secs(30));
    let relay = state.relay.clone();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("127.0.0.1:{}", addr.port()), relay)
}

async fn connect(host: &str, machine: &str) -> (Socket, String) {
    let (mut socket, _) = connect_async(format!("ws://{host}/ws/{machine}"))
        .await
        .unwrap();
    let member_id = loop {
        if let ServerFrame::Joined { member_id } = next_frame(&mut socket).await {
            break member_id;
        }
    };
    (socket, member_id)
}

async fn send(socket: &mut Socket, frame: &ClientFrame) {
    let text = serde_json::to_string(frame).unwrap();
    socket.send(Message::Text(text.into())).await.unwrap();
}

async fn next_frame(socket: &mut Socket) -> ServerFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame before deadline")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Waits for a presence snapshot satisfying `accept`.
async fn presence_where(socket: &mut Socket, accept: impl Fn(&[deskpilot_bus::Member]) -> bool) {
    loop {
        if let ServerFrame::PresenceSync { members } = next_frame(socket).await {
            if accept(&members) {
                return;
            }
        }
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn presence_and_commands_flow_between_agent_and_controller() {
    let host = spawn_server().await;

    let (mut agent, agent_id) = connect(&host, "m-1").await;
    send(
        &mut agent,
        &ClientFrame::Track {
            presence: json!({"role": "agent", "joined_at": "2026-01-01T00:00:00Z"}),
        },
    )
    .await;

    let (mut controller, _) = connect(&host, "m-1").await;
    send(
        &mut controller,
        &ClientFrame::Track {
            presence: json!({"role": "controller", "joined_at": "2026-01-01T00:00:01Z"}),
        },
    )
    .await;

    presence_where(&mut agent, |members| {
        members.iter().any(|m| m.meta["role"] == "controller")
    })
    .await;

    send(
        &mut controller,
        &ClientFrame::Broadcast {
            event: "command".into(),
            payload: json!({"type": "click", "button": "left"}),
        },
    )
    .await;

    loop {
        if let ServerFrame::Broadcast { from, event, payload } = next_frame(&mut agent).await {
            assert_ne!(from, agent_id);
            assert_eq!(event, "command");
            assert_eq!(payload["type"], "click");
            break;
        }
    }

    // Publishers never hear their own broadcasts.
    send(&mut controller, &ClientFrame::Ping).await;
    loop {
        match next_frame(&mut controller).await {
            ServerFrame::Pong => break,
            ServerFrame::Broadcast { .. } => panic!("controller received its own broadcast"),
            _ => {}
        }
    }

    drop(controller);
    presence_where(&mut agent, |members| {
        members.len() == 1 && members[0].meta["role"] == "agent"
    })
    .await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn claiming_over_http_notifies_the_agent_channel() {
    let host = spawn_server().await;
    let http = reqwest::Client::builder().no_proxy().build().unwrap();

    let registered = http
        .post(format!("http://{host}/sessions"))
        .json(&json!({"machine_id": "m-2", "pairing_code": "482913"}))
        .send()
        .await
        .unwrap();
    assert!(registered.status().is_success());

    let (mut agent, _) = connect(&host, "m-2").await;

    let claimed = http
        .post(format!("http://{host}/sessions/claim"))
        .json(&json!({"pairing_code": "482913", "principal_id": "u-1"}))
        .send()
        .await
        .unwrap();
    assert!(claimed.status().is_success());

    loop {
        if let ServerFrame::Broadcast { from, event, payload } = next_frame(&mut agent).await {
            assert_eq!(from, "relay");
            assert_eq!(event, "session_claimed");
            assert_eq!(payload["owner_id"], "u-1");
            break;
        }
    }

    let second = http
        .post(format!("http://{host}/sessions/claim"))
        .json(&json!({"pairing_code": "482913", "principal_id": "u-2"}))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status().as_u16(), 409);
}

#[test_timeout::tokio_timeout_test(30)]
async fn clients_cannot_announce_claims() {
    let host = spawn_server().await;
    let (mut agent, _) = connect(&host, "m-3").await;
    let (mut controller, _) = connect(&host, "m-3").await;

    send(
        &mut controller,
        &ClientFrame::Broadcast {
            event: "session_claimed".into(),
            payload: json!({"owner_id": "mallory"}),
        },
    )
    .await;
    loop {
        match next_frame(&mut controller).await {
            ServerFrame::Error { message } => {
                assert!(message.contains("session_claimed"));
                break;
            }
            ServerFrame::Broadcast { .. } => panic!("unexpected broadcast"),
            _ => {}
        }
    }

    // Commands still go through, and nothing reached the agent before them.
    send(
        &mut controller,
        &ClientFrame::Broadcast {
            event: "command".into(),
            payload: json!({"type": "wait", "ms": 10}),
        },
    )
    .await;
    loop {
        if let ServerFrame::Broadcast { event, .. } = next_frame(&mut agent).await {
            assert_eq!(event, "command");
            break;
        }
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn closed_connections_release_their_channel() {
    let (host, relay) = spawn_server_with_relay().await;
    for machine in ["scan-1", "scan-2", "scan-3"] {
        let (socket, _) = connect(&host, machine).await;
        drop(socket);
    }
    let (mut agent, _) = connect(&host, "m-4").await;
    send(
        &mut agent,
        &ClientFrame::Track {
            presence: json!({"role": "agent"}),
        },
    )
    .await;
    presence_where(&mut agent, |members| members.len() == 1).await;

    for _ in 0..200 {
        if relay.open_channels() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.open_channels(), 1);

    agent.close(None).await.unwrap();
    for _ in 0..200 {
        if relay.open_channels() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.open_channels(), 0);
    assert!(relay.members("m-4").is_empty());
}
