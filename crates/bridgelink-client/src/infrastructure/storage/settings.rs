//! TOML-based settings for the BridgeLink client.
//!
//! Reads and writes `ClientSettings` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\BridgeLink\settings.toml`
//! - Linux:    `~/.config/bridgelink/settings.toml`
//! - macOS:    `~/Library/Application Support/BridgeLink/settings.toml`
//!
//! ```toml
//! log_level = "info"
//!
//! [device]
//! device_id = "5f0c6c1e-7d43-4a54-9d59-0e1c5ad3c1a4"
//! device_name = "kitchen-tablet"
//!
//! [discovery]
//! service_type = "_armorclaw._tcp.local."
//! timeout_ms = 5000
//!
//! [[discovery.static_bridges]]
//! name = "den-bridge"
//! host = "192.168.1.5"
//! port = 8443
//!
//! [retry]
//! initial_delay_ms = 1000
//! multiplier = 2.0
//! max_delay_ms = 30000
//! jitter_factor = 0.3
//! max_retries = 3
//! operation_timeout_ms = 30000
//! ```
//!
//! Every field has a `#[serde(default = "...")]` helper so a missing file, a
//! missing section, or a file written by an older client all load cleanly.
//! Settings are operator preferences; the trust table and the active server
//! configuration live in the separate state file (see [`super::TomlFileStore`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bridgelink_core::domain::candidate::SERVICE_TYPE;
use bridgelink_core::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const SETTINGS_FILE_NAME: &str = "settings.toml";
pub const STATE_FILE_NAME: &str = "state.toml";

/// Error type for settings file operations.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing settings at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse settings TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The settings could not be serialized to TOML.
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Settings schema types ─────────────────────────────────────────────────────

/// Top-level settings stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientSettings {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Identity this device presents to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    /// Sent in the event-channel registration frame.
    #[serde(default = "Uuid::new_v4")]
    pub device_id: Uuid,
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySettings {
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Single-shot discovery deadline.
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Bridges announced without multicast DNS, for networks that block it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_bridges: Vec<StaticBridge>,
}

/// A bridge address configured by hand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticBridge {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Same keys a bridge would advertise in its TXT record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub txt: BTreeMap<String, String>,
}

/// Backoff curve and the hard deadline around a retried operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageSettings {
    /// Overrides the state file location.  Defaults to `state.toml` next to
    /// the settings file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_device_name() -> String {
    "bridgelink-client".to_string()
}
fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}
fn default_discovery_timeout_ms() -> u64 {
    5_000
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter_factor() -> f64 {
    0.3
}
fn default_max_retries() -> u32 {
    3
}
fn default_operation_timeout_ms() -> u64 {
    30_000
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_id: Uuid::new_v4(),
            device_name: default_device_name(),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            timeout_ms: default_discovery_timeout_ms(),
            static_bridges: Vec::new(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            max_retries: default_max_retries(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl RetrySettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_factor: self.jitter_factor,
            max_retries: self.max_retries,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl DiscoverySettings {
    /// A zero timeout is treated as unset.
    pub fn timeout(&self) -> Duration {
        match self.timeout_ms {
            0 => Duration::from_millis(default_discovery_timeout_ms()),
            ms => Duration::from_millis(ms),
        }
    }
}

// ── Settings repository ───────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for BridgeLink files.
///
/// # Errors
///
/// Returns [`SettingsError::NoPlatformConfigDir`] when the platform config
/// base directory cannot be determined from the environment.
pub fn settings_dir() -> Result<PathBuf, SettingsError> {
    platform_config_dir().ok_or(SettingsError::NoPlatformConfigDir)
}

pub fn settings_file_path() -> Result<PathBuf, SettingsError> {
    Ok(settings_dir()?.join(SETTINGS_FILE_NAME))
}

impl ClientSettings {
    /// Where the trust table and active config are persisted.
    pub fn state_file_path(&self) -> Result<PathBuf, SettingsError> {
        match &self.storage.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(settings_dir()?.join(STATE_FILE_NAME)),
        }
    }
}

/// Loads settings from `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`SettingsError::Io`] for file-system errors other than "not
/// found", and [`SettingsError::Parse`] if the TOML is malformed.
pub fn load_settings_from(path: &Path) -> Result<ClientSettings, SettingsError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientSettings::default()),
        Err(e) => Err(SettingsError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `settings` to `path`, creating parent directories as needed.
pub fn save_settings_to(path: &Path, settings: &ClientSettings) -> Result<(), SettingsError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| SettingsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(settings)?;
    std::fs::write(path, content).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("BridgeLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("bridgelink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("BridgeLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
