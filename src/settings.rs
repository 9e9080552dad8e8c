//! Startup settings.
//!
//! Settings come from an optional TOML file and the command line. Every file
//! field is optional; the command line wins over the file, and the engine
//! defaults fill whatever neither sets.
//!
//! File lookup order:
//! 1. `--config <path>` (must exist)
//! 2. `$PEERCHAT_CONFIG` (must exist)
//! 3. `<config_dir>/peerchat/config.toml` (skipped when missing)

use std::env;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use peerchat_core::{DomainError, Port};
use peerchat_net::EngineConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "PEERCHAT_CONFIG";

/// Errors from loading the settings file.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Contents of `config.toml`.
///
/// ```toml
/// port = 6000
/// bind_address = "192.168.1.8"
/// flush_delay_ms = 500
/// connect_timeout_ms = 10000
/// read_chunk_size = 4096
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub port: Option<u16>,
    pub bind_address: Option<IpAddr>,
    pub flush_delay_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub read_chunk_size: Option<usize>,
}

/// Default settings file location.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("peerchat").join("config.toml"))
}

impl Settings {
    /// Loads settings following the lookup order above.
    ///
    /// # Errors
    ///
    /// A file named explicitly (flag or environment) that cannot be read,
    /// or any file that does not parse.
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        match default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => {
                debug!("No settings file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reads one settings file.
    ///
    /// # Errors
    ///
    /// `SettingsError::Read` or `SettingsError::Parse`.
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// Picks the listening port: command line first, then the file.
    ///
    /// An invalid value is not fatal; it is reported and replaced by the
    /// default port.
    pub fn resolve_port(&self, cli: Option<&str>) -> Port {
        let candidate: Result<Port, DomainError> = match (cli, self.port) {
            (Some(raw), _) => raw.parse(),
            (None, Some(value)) => Port::new(value),
            (None, None) => return Port::default(),
        };
        candidate.unwrap_or_else(|e| {
            warn!(error = %e, default = %Port::default(), "Using default port");
            Port::default()
        })
    }

    /// Builds the engine configuration for `port`.
    ///
    /// `bind` (from the command line) overrides the file's `bind_address`.
    pub fn to_engine_config(&self, port: Port, bind: Option<IpAddr>) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            port: port.get(),
            bind_address: bind.or(self.bind_address),
            flush_delay: self
                .flush_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_delay),
            connect_timeout: self
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            read_chunk_size: self
                .read_chunk_size
                .filter(|size| *size > 0)
                .unwrap_or(defaults.read_chunk_size),
            ..defaults
        }
    }
}
