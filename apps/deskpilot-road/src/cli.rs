use anyhow::Result;
use clap::{Parser, Subcommand};
use deskpilot_bus::relay::{ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use deskpilot_road::config::StoreBackend;

#[derive(Parser, Debug)]
#[command(name = "deskpilot-road")]
#[command(about = "Deskpilot session registry and relay server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Listen port (overrides DESKPILOT_ROAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Session store backend (overrides DESKPILOT_STORE)
    #[arg(long, value_enum)]
    pub store: Option<StoreBackend>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print presence and broadcasts seen on a machine's channel
    Watch {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Machine id whose channel to observe
        #[arg(short, long)]
        machine: String,
    },
}

pub async fn run_watch_client(url: String, machine: String) -> Result<()> {
    let ws_url = format!("{}/ws/{}", url.trim_end_matches('/'), machine);
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "Connection timeout - is the relay server running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let ping = serde_json::to_string(&ClientFrame::Ping)?;
                write.send(Message::Text(ping.into())).await?;
            }
            msg = read.next() => {
                let Some(msg) = msg else { break };
                let Message::Text(text) = msg? else { continue };
                match serde_json::from_str::<ServerFrame>(text.as_str())? {
                    ServerFrame::Joined { member_id } => println!("joined as {member_id}"),
                    ServerFrame::PresenceSync { members } => {
                        println!("presence ({} members)", members.len());
                        for member in members {
                            println!("  {} {}", member.id, member.meta);
                        }
                    }
                    ServerFrame::Broadcast { from, event, payload } => {
                        println!("[{event}] from {from}: {payload}");
                    }
                    ServerFrame::Pong => {}
                    ServerFrame::Error { message } => eprintln!("relay error: {message}"),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn store_and_port_flags_parse() {
        let cli = Cli::try_parse_from(["deskpilot-road", "--store", "memory", "--port", "9090"])
            .unwrap();
        assert_eq!(cli.store, Some(StoreBackend::Memory));
        assert_eq!(cli.port, Some(9090));
        assert!(cli.command.is_none());
    }

    #[test_timeout::timeout]
    fn watch_requires_a_machine() {
        assert!(Cli::try_parse_from(["deskpilot-road", "watch"]).is_err());
        let cli = Cli::try_parse_from(["deskpilot-road", "watch", "--machine", "m-1"]).unwrap();
        match cli.command {
            Some(Commands::Watch { url, machine }) => {
                assert_eq!(url, "ws://localhost:8080");
                assert_eq!(machine, "m-1");
            }
            None => panic!("expected watch"),
        }
    }
}
