//! TOML-based configuration for the `tether-server` binary.
//!
//! The default location is the platform config directory:
//! - Windows:  `%APPDATA%\Tether\server.toml`
//! - Linux:    `~/.config/tether/server.toml`
//! - macOS:    `~/Library/Application Support/Tether/server.toml`
//!
//! Every field has a default, so a missing file, a missing section or a
//! missing key all fall back to sensible values.  Example:
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! ports = [8080]
//! multiplexed = true
//!
//! [pool]
//! max_size = 128
//!
//! [websocket]
//! max_frame_size = 65000
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_net::{EndpointConfig, SelectConfig, SessionConfig};
use thiserror::Error;

use crate::application::echo::EchoConfig;
use crate::infrastructure::network::listener::ListenerConfig;
use crate::infrastructure::network::worker_pool::WorkerPoolConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but makes no sense (bad address, zero-sized pool).
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub select: SelectSection,
    #[serde(default)]
    pub endpoint: EndpointSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
}

/// Listening sockets and handler behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Ports served by the echo handler; `0` picks an ephemeral port.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// Read through the shared multiplexer instead of one blocking read per
    /// connection.
    #[serde(default)]
    pub multiplexed: bool,
    /// `tracing` log level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_accept_poll_interval_ms")]
    pub accept_poll_interval_ms: u64,
    #[serde(default = "default_idle_log_interval_secs")]
    pub idle_log_interval_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Silence before a keep-alive ping.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSection {
    #[serde(default = "default_pool_initial_size")]
    pub initial_size: usize,
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    #[serde(default = "default_pool_idle_page_size")]
    pub idle_page_size: usize,
    #[serde(default = "default_pool_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectSection {
    #[serde(default = "default_sockets_per_thread")]
    pub sockets_per_thread: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointSection {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How long a dropped session stays resumable.
    #[serde(default = "default_postpone_timeout_secs")]
    pub postpone_timeout_secs: u64,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketSection {
    /// Largest frame sent, header included.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_true")]
    pub strict: bool,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_ports() -> Vec<u16> {
    vec![8080]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_accept_poll_interval_ms() -> u64 {
    200
}
fn default_idle_log_interval_secs() -> u64 {
    60
}
fn default_shutdown_timeout_secs() -> u64 {
    5
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_keepalive_secs() -> u64 {
    30
}
fn default_pool_initial_size() -> usize {
    4
}
fn default_pool_max_size() -> usize {
    64
}
fn default_pool_idle_page_size() -> usize {
    4
}
fn default_pool_queue_capacity() -> usize {
    1024
}
fn default_sockets_per_thread() -> usize {
    512
}
fn default_max_threads() -> usize {
    16
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_postpone_timeout_secs() -> u64 {
    120
}
fn default_linger_ms() -> u64 {
    500
}
fn default_max_frame_size() -> usize {
    64 * 1024
}
fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_write_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ports: default_ports(),
            multiplexed: false,
            log_level: default_log_level(),
            accept_poll_interval_ms: default_accept_poll_interval_ms(),
            idle_log_interval_secs: default_idle_log_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            initial_size: default_pool_initial_size(),
            max_size: default_pool_max_size(),
            idle_page_size: default_pool_idle_page_size(),
            queue_capacity: default_pool_queue_capacity(),
        }
    }
}

impl Default for SelectSection {
    fn default() -> Self {
        Self {
            sockets_per_thread: default_sockets_per_thread(),
            max_threads: default_max_threads(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for EndpointSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            postpone_timeout_secs: default_postpone_timeout_secs(),
            linger_ms: default_linger_ms(),
        }
    }
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_message_size: default_max_message_size(),
            strict: default_true(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

// ── Runtime settings ──────────────────────────────────────────────────────────

impl ServerConfig {
    /// Settings for the connection listener and its worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an unparsable bind address or
    /// an inconsistent pool size.
    pub fn listener_config(&self) -> Result<ListenerConfig, ConfigError> {
        let bind_address: IpAddr = self
            .server
            .bind_address
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                field: "server.bind_address",
                reason: e.to_string(),
            })?;
        if self.pool.max_size == 0 || self.pool.initial_size > self.pool.max_size {
            return Err(ConfigError::InvalidValue {
                field: "pool.max_size",
                reason: format!(
                    "must be at least 1 and not below initial_size ({})",
                    self.pool.initial_size
                ),
            });
        }
        Ok(ListenerConfig {
            bind_address,
            accept_poll_interval: Duration::from_millis(self.server.accept_poll_interval_ms),
            idle_log_interval: Duration::from_secs(self.server.idle_log_interval_secs),
            shutdown_timeout: Duration::from_secs(self.server.shutdown_timeout_secs),
            endpoint: self.endpoint_config(),
            pool: self.pool_config(),
        })
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            initial_size: self.pool.initial_size,
            max_size: self.pool.max_size,
            idle_page_size: self.pool.idle_page_size,
            queue_capacity: self.pool.queue_capacity,
        }
    }

    pub fn select_config(&self) -> SelectConfig {
        SelectConfig {
            sockets_per_thread: self.select.sockets_per_thread,
            max_threads: self.select.max_threads,
            poll_interval: Duration::from_millis(self.select.poll_interval_ms),
        }
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            idle_timeout: Duration::from_secs(self.endpoint.idle_timeout_secs),
            postpone_timeout: Duration::from_secs(self.endpoint.postpone_timeout_secs),
            linger: Duration::from_millis(self.endpoint.linger_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_frame_size: self.websocket.max_frame_size,
            max_message_size: self.websocket.max_message_size,
            strict: self.websocket.strict,
            write_timeout: Some(Duration::from_millis(self.websocket.write_timeout_ms)),
        }
    }

    pub fn echo_config(&self) -> EchoConfig {
        EchoConfig {
            session: self.session_config(),
            handshake_timeout: Duration::from_millis(self.server.handshake_timeout_ms),
            keepalive: Duration::from_secs(self.server.keepalive_secs),
            multiplexed: self.server.multiplexed,
            ..EchoConfig::default()
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("server.toml"))
}

/// Loads the config from the platform location.  Falls back to
/// `ServerConfig::default()` when there is no file or no config directory.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    match config_file_path() {
        Ok(path) => load_config_from(&path),
        Err(ConfigError::NoPlatformConfigDir) => Ok(ServerConfig::default()),
        Err(e) => Err(e),
    }
}

/// Loads the config from `path`, returning defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
pub fn save_config_to(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Tether"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("tether"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("Tether"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
