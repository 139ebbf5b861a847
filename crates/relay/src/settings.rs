//! Engine settings
//!
//! Each setting is resolved in priority order:
//! 1. `relay.json` in the config directory
//! 2. Environment variables (`RELAY_*`)
//! 3. Built-in defaults

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use config::ConfigDir;
use serde::{Deserialize, Serialize};

/// Settings filename in the config directory
pub const SETTINGS_FILE: &str = "relay.json";

pub const DEFAULT_CHUNK_SIZE: usize = 10;
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DATABASE_FILE: &str = "relay.sqlite";

/// Runtime settings for the engine and daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Records per destination write
    pub chunk_size: usize,
    /// Runs executed concurrently
    pub worker_threads: usize,
    pub http_timeout_secs: u64,
    /// How often the daemon looks for due syncs
    pub tick_interval_secs: u64,
    /// Skip records whose fingerprint matches the last write (incremental syncs only)
    pub skip_unchanged_records: bool,
    pub notification_recipients: Vec<String>,
    /// SQLite database, relative to the config directory
    pub database_file: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            worker_threads: DEFAULT_WORKER_THREADS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            skip_unchanged_records: false,
            notification_recipients: Vec::new(),
            database_file: DEFAULT_DATABASE_FILE.to_string(),
        }
    }
}

/// `relay.json` contents; every field optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    chunk_size: Option<usize>,
    worker_threads: Option<usize>,
    http_timeout_secs: Option<u64>,
    tick_interval_secs: Option<u64>,
    skip_unchanged_records: Option<bool>,
    notification_recipients: Option<Vec<String>>,
    database_file: Option<String>,
}

fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(name)
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("Invalid value for {name}"))
}

impl EngineSettings {
    /// Load settings for the given config directory
    pub fn load(dir: &ConfigDir) -> Result<Self> {
        let file: Option<SettingsFile> = dir.load_json_opt(SETTINGS_FILE)?;
        Self::from_sources(file, |name| std::env::var(name).ok())
    }

    /// Resolve settings from an optional file and an environment lookup
    pub fn from_sources(
        file: Option<SettingsFile>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let recipients = file.notification_recipients.or_else(|| {
            env("RELAY_NOTIFY").map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
        });

        let settings = Self {
            chunk_size: match file.chunk_size {
                Some(n) => n,
                None => env_parse(&env, "RELAY_CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
            },
            worker_threads: match file.worker_threads {
                Some(n) => n,
                None => {
                    env_parse(&env, "RELAY_WORKER_THREADS")?.unwrap_or(defaults.worker_threads)
                }
            },
            http_timeout_secs: match file.http_timeout_secs {
                Some(n) => n,
                None => env_parse(&env, "RELAY_HTTP_TIMEOUT_SECS")?
                    .unwrap_or(defaults.http_timeout_secs),
            },
            tick_interval_secs: match file.tick_interval_secs {
                Some(n) => n,
                None => env_parse(&env, "RELAY_TICK_INTERVAL_SECS")?
                    .unwrap_or(defaults.tick_interval_secs),
            },
            skip_unchanged_records: file
                .skip_unchanged_records
                .unwrap_or(defaults.skip_unchanged_records),
            notification_recipients: recipients.unwrap_or(defaults.notification_recipients),
            database_file: file.database_file.unwrap_or(defaults.database_file),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunk_size > 0, "chunk_size must be at least 1");
        ensure!(self.worker_threads > 0, "worker_threads must be at least 1");
        ensure!(self.tick_interval_secs > 0, "tick_interval_secs must be at least 1");
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}
