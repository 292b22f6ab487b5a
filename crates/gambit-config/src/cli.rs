//! Command-line argument parsing for the Gambit client.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Gambit client command-line arguments.
///
/// CLI values override settings loaded from the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "gambit-client", about = "Gambit headless session client")]
pub struct CliArgs {
    /// Server endpoint, e.g. tcp://127.0.0.1:7777.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Player display name.
    #[arg(long)]
    pub name: Option<String>,

    /// Game to join after connecting.
    #[arg(long)]
    pub game: Option<String>,

    /// Stop reconnecting after this many consecutive failures.
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    /// Delta polling period in milliseconds.
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref endpoint) = args.endpoint {
            self.network.endpoint = endpoint.clone();
        }
        if let Some(ref name) = args.name {
            self.player.name = name.clone();
        }
        if let Some(ref game) = args.game {
            self.player.default_game = Some(game.clone());
        }
        if let Some(max) = args.max_reconnect_attempts {
            self.reconnect.max_attempts = Some(max);
        }
        if let Some(ms) = args.poll_interval_ms {
            self.sync.poll_interval_ms = ms;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
