//! Load watch config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use trinity_core::SensorAccess;

/// Simulated platform authorization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authorization {
    Authorized,
    /// Not yet decided; the simulated prompt grants access.
    NotAuthorized,
    /// Not yet decided; the simulated prompt refuses access.
    Denied,
    Unavailable,
}

impl Authorization {
    /// Status the sensor session sees when monitoring starts.
    pub fn access(self) -> SensorAccess {
        match self {
            Authorization::Authorized => SensorAccess::Authorized,
            Authorization::NotAuthorized | Authorization::Denied => SensorAccess::NotAuthorized,
            Authorization::Unavailable => SensorAccess::Unavailable,
        }
    }

    /// Answer to an authorization prompt.
    pub fn prompt_result(self) -> bool {
        matches!(self, Authorization::Authorized | Authorization::NotAuthorized)
    }
}

/// Watch configuration. File: ~/.config/trinity/watch.toml or /etc/trinity/watch.toml.
/// Env overrides: TRINITY_WATCH_PORT, TRINITY_SAMPLE_INTERVAL_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Phone link TCP port (default 47410).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Simulated sensor delivery interval (default 1000 ms).
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_authorization")]
    pub authorization: Authorization,
}

fn default_listen_port() -> u16 {
    47410
}
fn default_sample_interval_ms() -> u64 {
    1000
}
fn default_authorization() -> Authorization {
    Authorization::Authorized
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            sample_interval_ms: default_sample_interval_ms(),
            authorization: default_authorization(),
        }
    }
}

impl Config {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
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
    if let Ok(s) = std::env::var("TRINITY_WATCH_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("TRINITY_SAMPLE_INTERVAL_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.sample_interval_ms = ms;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/trinity/watch.toml"));
    }
    out.push(PathBuf::from("/etc/trinity/watch.toml"));
    out
}

/// First existing path wins.
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
