//! Configuration loading for webrelay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! section and field is optional and falls back to its default.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration for webrelay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// WebSocket server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Message store configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// P2P network configuration.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
}

/// WebSocket server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the WebSocket listener (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Seconds a new connection has to send each authentication frame (default: 30).
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Largest accepted WebSocket frame in bytes (default: 1MB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Frames queued per connection before live delivery to it fails (default: 256).
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
}

/// Which authentication flow the WebSocket endpoint runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// `{userID, subscriptionKey}` login with persistence and replay.
    #[default]
    Subscription,
    /// Ed25519 challenge-response login with an echo session.
    Identity,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Active authentication flow (default: subscription).
    #[serde(default)]
    pub mode: AuthMode,
}

/// Message store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Durable SQLite database.
    #[default]
    Sqlite,
    /// Process memory; lost on restart.
    Memory,
}

/// Message store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Store backend (default: sqlite).
    #[serde(default)]
    pub backend: StorageBackend,
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Attempts for store operations failing with a transient error (default: 3).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay between attempts in milliseconds, multiplied by the attempt number (default: 50).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// P2P network implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// iroh QUIC endpoint.
    #[default]
    Iroh,
    /// In-process hub (no external connectivity).
    Memory,
}

/// P2P network configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    /// Network implementation (default: iroh).
    #[serde(default)]
    pub mode: NetworkMode,
    /// Secret key path for the iroh endpoint (optional, generates if missing).
    pub secret_key_path: Option<PathBuf>,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum WebSocket connection attempts per client IP per minute (default: 60).
    #[serde(default = "default_connections_per_minute")]
    pub connections_per_minute: u32,
    /// Maximum inbound frames per serving connection per minute (default: 600).
    #[serde(default = "default_frames_per_minute")]
    pub frames_per_minute: u32,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Serve `/health` and `/metrics` next to the WebSocket route (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_auth_timeout_secs() -> u64 {
    30
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_outbound_queue_size() -> usize {
    256
}

fn default_database_path() -> PathBuf {
    PathBuf::from("webrelay.db")
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_connections_per_minute() -> u32 {
    60
}

fn default_frames_per_minute() -> u32 {
    600
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            auth_timeout_secs: default_auth_timeout_secs(),
            max_frame_size: default_max_frame_size(),
            outbound_queue_size: default_outbound_queue_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database: default_database_path(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_minute: default_connections_per_minute(),
            frames_per_minute: default_frames_per_minute(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load configuration from `path`, or use defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
