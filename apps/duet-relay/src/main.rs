use clap::Parser;
use duet_relay::{
    cli::{self, Cli, Commands},
    metrics, Config, SignalingState,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        room,
        identity,
        watch_secs,
    }) = cli.command.clone()
    {
        if let Err(e) = cli::run_probe(url, room, identity, watch_secs).await {
            error!("probe failed: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = cli.apply(Config::from_env());
    info!(
        port = config.port,
        policy = ?config.full_room_policy,
        "starting duet relay"
    );

    let metrics_handle = if config.metrics_enabled {
        match metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("metrics disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("duet relay listening on {}", addr);

    let state = SignalingState::new(config, metrics_handle);
    if let Err(e) = duet_relay::serve(listener, state).await {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}
