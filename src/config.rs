//! Runtime configuration
//!
//! Values come from defaults, an optional TOML file, and `TABSYNC_*`
//! environment variables (a `.env` file is honoured), in that order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Session is considered expired after this long without a refresh.
pub const SESSION_TIMEOUT_MS: i64 = 3_600_000;

/// Interval of the periodic expiry check.
pub const CHECK_INTERVAL_MS: u64 = 60_000;

/// Debounce window for `refresh_session`.
pub const MIN_UPDATE_INTERVAL_MS: i64 = 15_000;

/// Well-known broadcast channel shared by all tabs of one application.
pub const DEFAULT_CHANNEL: &str = "tabsync";

/// Sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Session lifetime without refresh
    pub session_timeout_ms: i64,

    /// How often the expiry tick runs
    pub check_interval_ms: u64,

    /// Minimum spacing between two accepted session refreshes
    pub min_update_interval_ms: i64,

    /// Broadcast channel name
    pub channel_name: String,

    /// Reject `session_refresh` messages older than the local start time
    pub monotonic_adoption: bool,

    /// SQLite file backing the persistent cache
    pub cache_path: Option<PathBuf>,

    /// Base URL of the settings authority
    pub remote_url: Option<String>,

    /// Timeout applied to every authority request
    pub request_timeout_ms: u64,

    /// WebSocket relay bridging tabs in other processes
    pub relay_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: SESSION_TIMEOUT_MS,
            check_interval_ms: CHECK_INTERVAL_MS,
            min_update_interval_ms: MIN_UPDATE_INTERVAL_MS,
            channel_name: DEFAULT_CHANNEL.to_string(),
            monotonic_adoption: false,
            cache_path: None,
            remote_url: None,
            request_timeout_ms: 30_000,
            relay_url: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: SyncConfig = toml::from_str(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `TABSYNC_*` environment variables over this configuration
    pub fn with_env_overrides(mut self) -> Result<Self> {
        dotenvy::dotenv().ok();

        if let Some(v) = env_parse("TABSYNC_SESSION_TIMEOUT_MS")? {
            self.session_timeout_ms = v;
        }
        if let Some(v) = env_parse("TABSYNC_CHECK_INTERVAL_MS")? {
            self.check_interval_ms = v;
        }
        if let Some(v) = env_parse("TABSYNC_MIN_UPDATE_INTERVAL_MS")? {
            self.min_update_interval_ms = v;
        }
        if let Some(v) = env_parse("TABSYNC_MONOTONIC_ADOPTION")? {
            self.monotonic_adoption = v;
        }
        if let Some(v) = env_parse("TABSYNC_REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("TABSYNC_CHANNEL") {
            self.channel_name = v;
        }
        if let Ok(v) = std::env::var("TABSYNC_CACHE_PATH") {
            self.cache_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("TABSYNC_REMOTE_URL") {
            self.remote_url = Some(v);
        }
        if let Ok(v) = std::env::var("TABSYNC_RELAY_URL") {
            self.relay_url = Some(v);
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.session_timeout_ms <= 0 {
            anyhow::bail!("session_timeout_ms must be positive");
        }
        if self.check_interval_ms == 0 {
            anyhow::bail!("check_interval_ms must be positive");
        }
        if self.min_update_interval_ms < 0 {
            anyhow::bail!("min_update_interval_ms must not be negative");
        }
        if self.channel_name.is_empty() {
            anyhow::bail!("channel_name must not be empty");
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{name}={raw:?} is invalid: {e}")),
        Err(_) => Ok(None),
    }
}
