//! TOML configuration for the command-line client.
//!
//! Everything has a default, so a missing file or an empty table still
//! yields a usable configuration; command-line flags override file values
//! in `main`.
//!
//! ```toml
//! [hub]
//! host = "192.168.1.40"
//! uuid = "0f1e2d3c"
//! port = 5222
//!
//! [run]
//! dry_run = false
//! delay_secs = 0
//!
//! [log]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{SessionConfig, DEFAULT_HUB_PORT};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
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
}

/// Top-level configuration file schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub log: LogSection,
}

/// Which hub to talk to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSection {
    /// Hub host or IP; omit to discover on the LAN.
    pub host: Option<String>,
    /// Restrict discovery to this hub uuid.
    pub uuid: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Per-run behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSection {
    /// Verify connectivity without sending the command.
    #[serde(default)]
    pub dry_run: bool,
    /// Seconds to wait before starting the run (cancellable).
    #[serde(default)]
    pub delay_secs: u64,
}

/// Logging behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogSection {
    /// `tracing` filter: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            host: None,
            uuid: None,
            port: default_port(),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_HUB_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FileConfig {
    /// Loads a config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Parse`] when it is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parses config from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Writes the config back out, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The session configuration this file describes.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            target_host: self.hub.host.clone(),
            hub_uuid: self.hub.uuid.clone(),
            port: self.hub.port,
            dry_run: self.run.dry_run,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
