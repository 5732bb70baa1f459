use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use duet_proto::{generate_peer_identity, ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::config::{Config, FullRoomPolicy};

#[derive(Parser, Debug)]
#[command(name = "duet-relay")]
#[command(about = "Duet signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Port to listen on
    #[arg(long, env = "DUET_RELAY_PORT")]
    pub port: Option<u16>,

    /// What to do when a third peer joins a full room
    #[arg(long, value_enum, env = "DUET_RELAY_FULL_ROOM_POLICY")]
    pub full_room_policy: Option<FullRoomPolicy>,

    /// Disable the /metrics endpoint and recorder
    #[arg(long)]
    pub no_metrics: bool,
}

impl Cli {
    /// Layer command-line overrides on top of the environment config.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(policy) = self.full_room_policy {
            config.full_room_policy = policy;
        }
        if self.no_metrics {
            config.metrics_enabled = false;
        }
        config
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Join a room and print every message the relay sends back
    Probe {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Room to join
        #[arg(short, long)]
        room: String,

        /// Identity to join with (random if omitted)
        #[arg(short, long)]
        identity: Option<String>,

        /// How long to keep listening
        #[arg(long, default_value_t = 10)]
        watch_secs: u64,
    },
}

pub async fn run_probe(
    url: String,
    room: String,
    identity: Option<String>,
    watch_secs: u64,
) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(&ws_url))
        .await
        .map_err(|_| anyhow!("timed out connecting to {ws_url}"))?
        .with_context(|| format!("failed to connect to {ws_url}"))?;
    let (mut write, mut read) = ws_stream.split();

    let join = ClientMessage::Join {
        room_id: room.clone(),
        peer_identity: identity.unwrap_or_else(generate_peer_identity),
    };
    write
        .send(Message::Text(serde_json::to_string(&join)?.into()))
        .await
        .context("failed to send join")?;

    let deadline = Instant::now() + Duration::from_secs(watch_secs);
    loop {
        let next = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(next) => next,
            Err(_) => break,
        };
        let Some(frame) = next else {
            println!("relay closed the connection");
            break;
        };
        match frame? {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(message) => {
                    println!("{}", serde_json::to_string_pretty(&message)?);
                    if matches!(
                        message,
                        ServerMessage::RoomFull { .. } | ServerMessage::Evicted { .. }
                    ) {
                        break;
                    }
                }
                Err(e) => println!("unparsed frame ({e}): {}", text.as_str()),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = write
        .send(Message::Text(serde_json::to_string(&ClientMessage::Leave)?.into()))
        .await;
    Ok(())
}
