//! Configuration system for the Gambit client.
//!
//! Provides the connection, timeout, backoff and synchronization settings that
//! persist to disk as RON. Supports CLI overrides via clap, hot-reload
//! detection, and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, Config, DebugConfig, NetworkConfig, PlayerConfig, ReconnectConfig,
    SyncConfig, TimeoutConfig,
};
pub use error::ConfigError;
