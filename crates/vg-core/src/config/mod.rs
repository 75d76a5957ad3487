//! Configuration management for Vigil

mod client;
mod servers;
pub mod serde_utils;

pub use client::{BackoffConfig, ClientConfig, LockConfig};
pub use servers::ServerStore;

use crate::error::ConfigError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vigil")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Get the default persisted server list path
pub fn default_servers_path() -> PathBuf {
    default_config_dir().join("servers.toml")
}

/// Read and parse a TOML file.
///
/// A missing file is [`ConfigError::NotFound`] so callers can fall back to
/// defaults.
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(ConfigError::Invalid(format!("Failed to read {:?}: {}", path, e))),
    };
    Ok(toml::from_str(&content)?)
}

/// Write a TOML file, creating parent directories.
///
/// The content goes to a sibling temporary file first and is renamed over
/// the target, so readers never see a half-written server list.
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    let write_err = |e: std::io::Error| ConfigError::Invalid(format!("Failed to write {:?}: {}", path, e));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    std::fs::write(&staging, content).map_err(write_err)?;
    std::fs::rename(&staging, path).map_err(|e| {
        let _ = std::fs::remove_file(&staging);
        write_err(e)
    })
}
