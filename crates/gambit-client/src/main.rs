//! Headless session client: connects, joins a game and logs session events
//! until interrupted.

use std::path::PathBuf;

use clap::Parser;
use gambit_config::{CliArgs, Config};
use gambit_net::{CodecConfig, FrameConfig, SocketConfig, TcpConnector};
use gambit_session::{EventKind, SessionEvent, SessionManager};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(Config::default_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    gambit_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    tracing::info!(
        "Gambit client starting as {} against {}",
        config.player.name,
        config.network.endpoint
    );

    let connector = TcpConnector::new(
        FrameConfig {
            max_frame_bytes: config.network.max_frame_bytes,
        },
        CodecConfig {
            compression_threshold: config.network.compression_threshold,
            ..CodecConfig::default()
        },
        SocketConfig::with_keepalive_secs(config.network.tcp_keepalive_secs),
    );
    let session = SessionManager::new(&config, connector);
    log_events(&session);

    match session.join(config.player.default_game.as_deref()).await {
        Ok(joined) => tracing::info!(
            "Joined game {} as {}",
            joined.game_id,
            joined.player_id.as_deref().unwrap_or("<unassigned>")
        ),
        Err(e) => tracing::error!("Join failed: {e}"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
    }

    tracing::info!("Shutting down");
    if !session.leave().await {
        tracing::warn!("Leave was not acknowledged by the server");
    }
    session.shutdown();
}

fn log_events<C: gambit_net::Connector>(session: &SessionManager<C>) {
    for kind in EventKind::ALL {
        session.bus().subscribe(kind, |event: &SessionEvent| {
            match event {
                SessionEvent::Connect { epoch } => tracing::info!("Connected (epoch {epoch})"),
                SessionEvent::Disconnect {
                    reason,
                    reconnecting,
                } => tracing::warn!("Disconnected: {reason} (reconnecting: {reconnecting})"),
                SessionEvent::Error { error, attempt } => {
                    tracing::warn!("Connection attempt {attempt} failed: {error}")
                }
                SessionEvent::Connecting { attempt } => {
                    tracing::debug!("Connecting (attempt {attempt})")
                }
                SessionEvent::StateSnapshot(snapshot) => {
                    tracing::info!("Snapshot at t={}", snapshot.timestamp)
                }
                SessionEvent::StateUpdate(snapshot) => {
                    tracing::debug!("State advanced to t={}", snapshot.timestamp)
                }
                SessionEvent::PlayerJoined(player) => tracing::info!(
                    "Player joined: {}",
                    player.player_name.as_deref().unwrap_or("?")
                ),
                SessionEvent::PlayerLeft(player) => tracing::info!(
                    "Player left: {}",
                    player.player_id.as_deref().unwrap_or("?")
                ),
            }
            Ok(())
        });
    }
}
