//! Configuration directory handling for Relay
//!
//! All Relay processes share one config directory, `~/.config/relay/` by
//! default. Setting `RELAY_CONFIG_DIR` points every process at another
//! location (useful for tests and for running several daemons side by side).
//!
//! Call [`init`] at application startup to bootstrap the directory.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config directory location
pub const CONFIG_DIR_ENV: &str = "RELAY_CONFIG_DIR";

/// A resolved Relay config directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    /// Resolve the config directory from `RELAY_CONFIG_DIR` or the
    /// platform config directory.
    pub fn locate() -> Option<Self> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
            return Some(Self::at(dir));
        }
        dirs::config_dir().map(|p| Self::at(p.join("relay")))
    }

    /// Use an explicit directory
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a file inside the directory (the file need not exist)
    pub fn path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path(filename).exists()
    }

    /// Create the directory (and parents) if missing
    pub fn ensure(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create config directory: {}", self.root.display())
        })?;
        Ok(&self.root)
    }

    /// Load a JSON file from the directory
    pub fn load_json<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        load_json_file(&self.path(filename))
    }

    /// Load a JSON file if present, `None` otherwise
    pub fn load_json_opt<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        if !self.exists(filename) {
            return Ok(None);
        }
        self.load_json(filename).map(Some)
    }

    /// Write a value as pretty JSON, creating the directory if needed
    pub fn save_json<T: Serialize>(&self, filename: &str, value: &T) -> Result<()> {
        self.ensure()?;
        let path = self.path(filename);
        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}

/// Locate and create the Relay config directory.
///
/// Call this once at application startup.
pub fn init() -> Result<ConfigDir> {
    let dir = ConfigDir::locate().context("Could not determine config directory")?;
    dir.ensure()?;
    Ok(dir)
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}
