//! Bridge configuration: a TOML file with `CALLBRIDGE_*` environment overrides.

use crate::session::BridgeSettings;
use callbridge_voice::{BackendAudio, BackendConfig};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Everything the bridge binary reads at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Tenant store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// AI voice backend connection.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Per-call timeouts and queue bounds.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Side-channel action delivery.
    #[serde(default)]
    pub actions: ActionsConfig,
}

/// Listen address for the provider WebSocket and the HTTP routes.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout applied to every pooled connection.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long a tenant lookup waits for a free pooled connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "callbridge_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Call bridge tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// How long the AI backend has to connect before the call is declined.
    #[serde(default = "default_starting_timeout_ms")]
    pub starting_timeout_ms: u64,

    /// Flush window for in-flight backend audio once a call is draining.
    #[serde(default = "default_draining_grace_ms")]
    pub draining_grace_ms: u64,

    /// An active call with no inbound media for this long is closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How long a full backend or provider queue may block a call before
    /// that peer is given up on.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Period of the registry sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Media frames held while the backend connects.
    #[serde(default = "default_starting_buffer_frames")]
    pub starting_buffer_frames: usize,

    /// Depth of each session's inbound queue.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,

    /// Depth of each connection's outbound frame queue.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// RMS energy at or above which a caller frame counts as speech.
    #[serde(default = "default_barge_in_rms_threshold")]
    pub barge_in_rms_threshold: f64,
}

/// Where side-channel actions go.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionsConfig {
    /// Business-data webhook. Actions are only logged when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Request timeout for webhook delivery.
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "callbridge.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_acquire_timeout_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_starting_timeout_ms() -> u64 {
    5_000
}

fn default_draining_grace_ms() -> u64 {
    2_000
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_stall_timeout_ms() -> u64 {
    2_000
}

fn default_sweep_interval_secs() -> u64 {
    15
}

fn default_starting_buffer_frames() -> usize {
    // 2 seconds of 20 ms frames
    100
}

fn default_session_queue_capacity() -> usize {
    512
}

fn default_outbound_queue_capacity() -> usize {
    512
}

fn default_barge_in_rms_threshold() -> f64 {
    900.0
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            starting_timeout_ms: default_starting_timeout_ms(),
            draining_grace_ms: default_draining_grace_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            stall_timeout_ms: default_stall_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            starting_buffer_frames: default_starting_buffer_frames(),
            session_queue_capacity: default_session_queue_capacity(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            barge_in_rms_threshold: default_barge_in_rms_threshold(),
        }
    }
}

/// Why a configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Checks values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bridge = &self.bridge;
        let non_zero = [
            ("bridge.starting_timeout_ms", bridge.starting_timeout_ms),
            ("bridge.draining_grace_ms", bridge.draining_grace_ms),
            ("bridge.idle_timeout_secs", bridge.idle_timeout_secs),
            ("bridge.stall_timeout_ms", bridge.stall_timeout_ms),
            ("bridge.sweep_interval_secs", bridge.sweep_interval_secs),
            ("bridge.session_queue_capacity", bridge.session_queue_capacity as u64),
            ("bridge.outbound_queue_capacity", bridge.outbound_queue_capacity as u64),
            ("backend.connect_timeout_ms", self.backend.connect_timeout_ms),
            ("database.pool_max_size", self.database.pool_max_size as u64),
            ("database.acquire_timeout_ms", self.database.acquire_timeout_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be non-zero")));
            }
        }
        if !bridge.barge_in_rms_threshold.is_finite() || bridge.barge_in_rms_threshold <= 0.0 {
            return Err(ConfigError::Invalid(
                "bridge.barge_in_rms_threshold must be a positive number".to_string(),
            ));
        }
        BackendAudio::new(self.backend.sample_rate)
            .map_err(|e| ConfigError::Invalid(format!("backend.sample_rate: {e}")))?;
        Ok(())
    }

    /// Runtime settings for call sessions.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the backend sample rate is unsupported.
    pub fn bridge_settings(&self) -> Result<BridgeSettings, ConfigError> {
        let audio = BackendAudio::new(self.backend.sample_rate)
            .map_err(|e| ConfigError::Invalid(format!("backend.sample_rate: {e}")))?;
        let bridge = &self.bridge;
        Ok(BridgeSettings {
            starting_timeout: Duration::from_millis(bridge.starting_timeout_ms),
            draining_grace: Duration::from_millis(bridge.draining_grace_ms),
            idle_timeout: Duration::from_secs(bridge.idle_timeout_secs),
            stall_timeout: Duration::from_millis(bridge.stall_timeout_ms),
            sweep_interval: Duration::from_secs(bridge.sweep_interval_secs),
            starting_buffer_frames: bridge.starting_buffer_frames,
            session_queue_capacity: bridge.session_queue_capacity,
            outbound_queue_capacity: bridge.outbound_queue_capacity,
            barge_in_rms_threshold: bridge.barge_in_rms_threshold,
            audio,
        })
    }
}

/// Reads the config file, applies environment overrides, then validates.
///
/// A missing file is not an error: every section falls back to defaults.
///
/// Environment variable overrides:
/// - `CALLBRIDGE_HOST` overrides `server.host`
/// - `CALLBRIDGE_PORT` overrides `server.port`
/// - `CALLBRIDGE_DB_PATH` overrides `database.path`
/// - `CALLBRIDGE_LOG_LEVEL` overrides `logging.level`
/// - `CALLBRIDGE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `CALLBRIDGE_BACKEND_URL` overrides `backend.url`
/// - `CALLBRIDGE_BACKEND_API_KEY` overrides `backend.api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting values fail validation.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(host) = std::env::var("CALLBRIDGE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("CALLBRIDGE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("CALLBRIDGE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("CALLBRIDGE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("CALLBRIDGE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(url) = std::env::var("CALLBRIDGE_BACKEND_URL") {
        config.backend.url = url;
    }
    if let Ok(key) = std::env::var("CALLBRIDGE_BACKEND_API_KEY") {
        config.backend.api_key = key;
    }
}
