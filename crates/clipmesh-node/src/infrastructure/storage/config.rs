//! TOML-based configuration persistence for the node.
//!
//! Reads and writes [`AppConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\ClipMesh\config.toml`
//! - Linux:    `~/.config/clipmesh/config.toml`
//! - macOS:    `~/Library/Application Support/ClipMesh/config.toml`
//!
//! Every field carries a `#[serde(default = ...)]` so a partial file (or no
//! file at all on first run) deserialises to working defaults. The same
//! directory holds the peer state files managed by
//! [`super::peer_store::PeerStore`].
//!
//! The discovery broadcasts and the TCP data channel share a single
//! configured port; `set_port` enforces the unprivileged range before a new
//! value is accepted from the UI's port editor.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A port outside the accepted 1024–65535 range was supplied.
    #[error("port {0} is outside the accepted range 1024-65535")]
    PortOutOfRange(u16),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level application configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Identity and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Display name announced in HELLO replies. Defaults to the OS hostname.
    #[serde(default = "default_username")]
    pub username: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Port and discovery-cadence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Single port shared by UDP discovery and the TCP data channel.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds between periodic ANNOUNCE broadcasts.
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_username() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| clipmesh_core::UNKNOWN.to_string())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_port() -> u16 {
    1234
}
fn default_broadcast_interval() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            broadcast_interval_secs: default_broadcast_interval(),
        }
    }
}

// ── Collaborator accessors ────────────────────────────────────────────────────

impl AppConfig {
    /// The port shared by discovery and the data channel.
    pub fn current_port(&self) -> u16 {
        self.network.port
    }

    /// Seconds between ANNOUNCE broadcasts.
    pub fn broadcast_interval(&self) -> u64 {
        self.network.broadcast_interval_secs
    }

    /// The display name announced to peers.
    pub fn local_username(&self) -> &str {
        &self.general.username
    }

    /// Replaces the configured port after range validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PortOutOfRange`] for privileged or zero ports.
    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port < 1024 {
            return Err(ConfigError::PortOutOfRange(port));
        }
        self.network.port = port;
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for config and peer state.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot
/// be determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads [`AppConfig`] from disk, returning `AppConfig::default()` if the
/// file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let path = config_file_path()?;
    load_config_from(&path)
}

/// Loads [`AppConfig`] from an explicit path. Split out so tests can use a
/// temp directory.
pub fn load_config_from(path: &std::path::Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: AppConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to the platform config file.
///
/// Creates the config directory and file if they do not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;
    save_config_to(config, &path)
}

/// Persists `config` to an explicit path.
pub fn save_config_to(config: &AppConfig, path: &std::path::Path) -> Result<(), ConfigError> {
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
    })?;
    Ok(())
}

/// Resolves the platform config base directory including the app folder.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("ClipMesh"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("clipmesh"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("ClipMesh")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
