//! Configuration system for Parley.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PARLEY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/parley/config.toml
//!   3. ~/.config/parley/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::{DEFAULT_MAX_LINE_BYTES, DEFAULT_PORT, MIN_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_addr: IpAddr,
    /// TCP listen port. Valid range 1024-65535.
    pub port: u16,
    /// How long a new connection may take to send its name. 0 = unbounded.
    pub handshake_timeout_secs: u64,
    /// Longest accepted line, terminator excluded.
    pub max_line_bytes: usize,
    /// How long shutdown waits for sessions to say goodbye.
    pub shutdown_grace_secs: u64,
    /// Lines that may wait for one client's socket before that client is
    /// dropped as too slow.
    pub outbound_queue_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or IP of the server.
    pub server_addr: String,
    pub port: u16,
    /// Empty = ask interactively.
    pub display_name: String,
    pub connect_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            handshake_timeout_secs: 60,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            shutdown_grace_secs: 5,
            outbound_queue_lines: 256,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "localhost".to_string(),
            port: DEFAULT_PORT,
            display_name: String::new(),
            connect_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        match self.handshake_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ── Port validation ───────────────────────────────────────────────────────────

/// Parse a user-supplied port. Anything unparsable or below 1024 falls back
/// to the default port with a warning.
pub fn validate_port(raw: &str) -> u16 {
    match raw.trim().parse::<u16>() {
        Ok(port) if port >= MIN_PORT => port,
        Ok(port) => {
            tracing::warn!(
                port,
                default = DEFAULT_PORT,
                "invalid port number, valid range is {MIN_PORT}-65535; using default"
            );
            DEFAULT_PORT
        }
        Err(_) => {
            tracing::warn!(input = raw, default = DEFAULT_PORT, "invalid port format; using default");
            DEFAULT_PORT
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("parley")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ParleyConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            ParleyConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a specific file without applying env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PARLEY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ParleyConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PARLEY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PARLEY_SERVER__BIND_ADDR") {
            match v.parse() {
                Ok(addr) => self.server.bind_addr = addr,
                Err(_) => tracing::warn!(value = %v, "ignoring unparsable PARLEY_SERVER__BIND_ADDR"),
            }
        }
        if let Some(v) = var("PARLEY_SERVER__PORT") {
            self.server.port = validate_port(&v);
        }
        if let Some(v) = var("PARLEY_SERVER__HANDSHAKE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.server.handshake_timeout_secs = secs;
            }
        }
        if let Some(v) = var("PARLEY_SERVER__OUTBOUND_QUEUE_LINES") {
            match v.parse::<usize>() {
                Ok(lines) if lines > 0 => self.server.outbound_queue_lines = lines,
                _ => tracing::warn!(value = %v, "ignoring invalid PARLEY_SERVER__OUTBOUND_QUEUE_LINES"),
            }
        }
        if let Some(v) = var("PARLEY_CLIENT__SERVER_ADDR") {
            self.client.server_addr = v;
        }
        if let Some(v) = var("PARLEY_CLIENT__PORT") {
            self.client.port = validate_port(&v);
        }
        if let Some(v) = var("PARLEY_CLIENT__DISPLAY_NAME") {
            self.client.display_name = v;
        }
    }
}
