//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the file written into the config directory.
pub const CONFIG_FILE_NAME: &str = "client.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport settings.
    pub network: NetworkConfig,
    /// Local player identity.
    pub player: PlayerConfig,
    /// Per-operation deadlines.
    pub timeouts: TimeoutConfig,
    /// Reconnection backoff and throttling.
    pub reconnect: ReconnectConfig,
    /// Snapshot/delta synchronization.
    pub sync: SyncConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server endpoint, e.g. `tcp://127.0.0.1:7777`. A bare `host:port` is accepted too.
    pub endpoint: String,
    /// Largest frame accepted from or sent to the server.
    pub max_frame_bytes: u32,
    /// Encoded messages at or above this size are LZ4 compressed.
    pub compression_threshold: usize,
    /// TCP keepalive idle time in seconds (0 disables keepalive).
    pub tcp_keepalive_secs: u64,
}

/// Local player configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerConfig {
    /// Display name sent on registration and join.
    pub name: String,
    /// Game joined on startup by the headless client. `None` lets the server pick.
    pub default_game: Option<String>,
}

/// Operation deadlines, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Transport open deadline.
    pub connect_ms: u64,
    /// Register and join acknowledgement deadline.
    pub join_ms: u64,
    /// Leave acknowledgement deadline.
    pub leave_ms: u64,
    /// Full snapshot fetch deadline.
    pub snapshot_ms: u64,
    /// Delta fetch deadline.
    pub delta_ms: u64,
}

/// Reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied per failed attempt.
    pub growth_factor: f64,
    /// Upper bound on the computed delay (before jitter).
    pub max_delay_ms: u64,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Minimum spacing between caller-initiated connection attempts.
    pub min_attempt_interval_ms: u64,
}

/// State synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Delta polling period.
    pub poll_interval_ms: u64,
    /// Wait before retrying a failed full snapshot fetch.
    pub snapshot_retry_ms: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:7777".to_string(),
            max_frame_bytes: 1_048_576,
            compression_threshold: 256,
            tcp_keepalive_secs: 60,
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            name: "Player".to_string(),
            default_game: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            join_ms: 5_000,
            leave_ms: 3_000,
            snapshot_ms: 10_000,
            delta_ms: 5_000,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            growth_factor: 2.0,
            max_delay_ms: 30_000,
            max_attempts: None,
            min_attempt_interval_ms: 2_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            snapshot_retry_ms: 2_000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Duration accessors ---

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn join(&self) -> Duration {
        Duration::from_millis(self.join_ms)
    }

    pub fn leave(&self) -> Duration {
        Duration::from_millis(self.leave_ms)
    }

    pub fn snapshot(&self) -> Duration {
        Duration::from_millis(self.snapshot_ms)
    }

    pub fn delta(&self) -> Duration {
        Duration::from_millis(self.delta_ms)
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn min_attempt_interval(&self) -> Duration {
        Duration::from_millis(self.min_attempt_interval_ms)
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn snapshot_retry(&self) -> Duration {
        Duration::from_millis(self.snapshot_retry_ms)
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the client (`<config_dir>/gambit`).
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gambit"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .map_err(ConfigError::read(&config_path))?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as [`CONFIG_FILE_NAME`].
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::write(config_dir))?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::write(&config_path))?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let contents =
            std::fs::read_to_string(&config_path).map_err(ConfigError::read(&config_path))?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
