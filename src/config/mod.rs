//! Configuration management

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
}

/// Upstream session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Seconds to wait for the auth acknowledgment before failing establishment
    pub establish_timeout_secs: u64,

    /// Total validity window of an issued console token
    pub token_validity_secs: u64,

    /// Seconds before expiry at which the proactive token refresh fires
    pub refresh_buffer_secs: u64,

    /// Grace period before a session with no attached clients is torn down
    pub idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            establish_timeout_secs: 10,
            token_validity_secs: 600,
            refresh_buffer_secs: 60,
            idle_timeout_secs: 300,
        }
    }
}

/// Resolved durations the mux core runs on.
///
/// Kept separate from the file-facing [`UpstreamConfig`] so tests can run
/// with millisecond windows.
#[derive(Debug, Clone, Copy)]
pub struct MuxTimings {
    /// Bound on the establishment handshake wait
    pub establish_timeout: Duration,

    /// Total validity window of an issued token
    pub token_validity: Duration,

    /// How long before expiry the proactive refresh fires
    pub refresh_buffer: Duration,

    /// Grace period before an unused session is reaped
    pub idle_timeout: Duration,
}

impl MuxTimings {
    /// Delay from token issuance to the proactive refresh.
    pub fn refresh_delay(&self) -> Duration {
        self.token_validity.saturating_sub(self.refresh_buffer)
    }
}

impl Default for MuxTimings {
    fn default() -> Self {
        Self::from(&UpstreamConfig::default())
    }
}

impl From<&UpstreamConfig> for MuxTimings {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            establish_timeout: Duration::from_secs(config.establish_timeout_secs),
            token_validity: Duration::from_secs(config.token_validity_secs),
            refresh_buffer: Duration::from_secs(config.refresh_buffer_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

impl Config {
    /// Load config from the default path, or return defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a specific file, or return defaults if not found
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("switchboard")
            .join("config.toml")
    }

    /// Resolve the timing knobs into the durations the core runs on
    pub fn timings(&self) -> MuxTimings {
        MuxTimings::from(&self.upstream)
    }
}
