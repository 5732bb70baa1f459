use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use duet_client_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use duet_client_core::transport::webrtc::WebRtcFactory;
use duet_client_core::{DuetConfig, Peer};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "duet",
    about = "Open a reliable data channel to the other member of a room",
    author,
    version
)]
struct Cli {
    /// Room to join; both peers must use the same name.
    room: String,

    #[arg(
        long,
        env = "DUET_SIGNAL_URL",
        help = "Relay WebSocket URL (http/https are accepted)"
    )]
    signal_url: Option<String>,

    #[arg(
        long,
        env = "DUET_PEER_IDENTITY",
        help = "Stable identity; reuse it to resume after a restart"
    )]
    identity: Option<String>,

    #[arg(
        long = "ice-server",
        value_name = "URL",
        help = "STUN/TURN server; repeat for several"
    )]
    ice_servers: Vec<String>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "DUET_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "DUET_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    fn apply(&self, mut config: DuetConfig) -> DuetConfig {
        if let Some(url) = &self.signal_url {
            config.signaling.url = url.clone();
        }
        if self.identity.is_some() {
            config.identity = self.identity.clone();
        }
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers.clone();
        }
        config
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("failed to initialise logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = cli.apply(DuetConfig::from_env());
    let factory = Arc::new(
        WebRtcFactory::new(config.ice_servers.clone()).context("failed to set up webrtc")?,
    );
    let peer = Peer::connect(config, &cli.room, factory)
        .await
        .with_context(|| format!("failed to join room {}", cli.room))?;
    eprintln!(
        "🎧 joined {} as {} ({})",
        cli.room,
        peer.initial_role(),
        peer.identity()
    );

    peer.on_channel_open(|| eprintln!("🔗 channel open"));
    peer.on_channel_close(|| eprintln!("⛓️  channel closed"));
    peer.on_delivery_failed(|failure| {
        eprintln!(
            "⚠️  {} ({}) was not delivered: {:?}",
            failure.message_id, failure.message_type, failure.reason
        )
    });
    peer.on_reliable(|message_type, payload| print_message(message_type, payload));
    peer.on_raw(|message_type, payload| print_message(message_type, payload));

    let interactive = std::io::stdin().is_terminal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break };
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                match line.strip_prefix("/raw ") {
                    Some(text) => {
                        if !peer.send_raw("chat", json!({ "text": text })).await? && interactive {
                            eprintln!("channel not open; dropped");
                        }
                    }
                    None => {
                        peer.send_reliable("chat", json!({ "text": line })).await?;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    peer.close().await;
    Ok(())
}

fn print_message(message_type: &str, payload: &Value) {
    match payload.get("text").and_then(Value::as_str) {
        Some(text) if message_type == "chat" => println!("{text}"),
        _ => println!("[{message_type}] {payload}"),
    }
}
