//! Load phone config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use trinity_core::ControllerConfig;

/// Phone configuration. File: ~/.config/trinity/phone.toml or /etc/trinity/phone.toml.
/// Env overrides: TRINITY_WATCH_ADDR, TRINITY_COMMAND_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Watch link address (default 127.0.0.1:47410).
    #[serde(default = "default_watch_addr")]
    pub watch_addr: String,
    /// Samples kept for display (default 5).
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    /// Background sync timer cadence (default 1000 ms).
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Periodic background task interval; never below 15.
    #[serde(default = "default_background_fetch_minutes")]
    pub background_fetch_minutes: u64,
    /// Start/stop reply deadline; 0 waits forever.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Delay between link attempts (default 2000 ms).
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

fn default_watch_addr() -> String {
    "127.0.0.1:47410".to_string()
}
fn default_recent_window() -> usize {
    5
}
fn default_sync_interval_ms() -> u64 {
    1000
}
fn default_background_fetch_minutes() -> u64 {
    15
}
fn default_command_timeout_secs() -> u64 {
    10
}
fn default_reconnect_interval_ms() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_addr: default_watch_addr(),
            recent_window: default_recent_window(),
            sync_interval_ms: default_sync_interval_ms(),
            background_fetch_minutes: default_background_fetch_minutes(),
            command_timeout_secs: default_command_timeout_secs(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl Config {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            recent_window: self.recent_window,
            sync_interval: Duration::from_millis(self.sync_interval_ms.max(1)),
            background_fetch_interval: Duration::from_secs(
                self.background_fetch_minutes.saturating_mul(60),
            ),
            command_timeout: match self.command_timeout_secs {
                0 => None,
                s => Some(Duration::from_secs(s)),
            },
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(100))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("parse {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = match load_file() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            log::warn!("ignoring config file: {}", e);
            Config::default()
        }
    };
    if let Ok(s) = std::env::var("TRINITY_WATCH_ADDR") {
        if !s.is_empty() {
            c.watch_addr = s;
        }
    }
    if let Ok(s) = std::env::var("TRINITY_COMMAND_TIMEOUT_SECS") {
        if let Ok(secs) = s.parse::<u64>() {
            c.command_timeout_secs = secs;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/trinity/phone.toml"));
    }
    out.push(PathBuf::from("/etc/trinity/phone.toml"));
    out
}

fn load_file() -> Result<Option<Config>, ConfigError> {
    match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => parse_file(&p).map(Some),
        None => Ok(None),
    }
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    toml::from_str(&s).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
}
