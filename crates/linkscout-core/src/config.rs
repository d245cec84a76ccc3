//! Configuration system for Linkscout.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LINKSCOUT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/linkscout/config.toml
//!   3. ~/.config/linkscout/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
///
/// The `[suppression]` table is kept as a raw TOML value here; the
/// services crate owns the rule-set type and interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkscoutConfig {
    pub discovery: DiscoveryConfig,
    pub cluster: ClusterConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression: Option<toml::Value>,
    pub fabric: FabricConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// If false, link discovery is disabled entirely.
    pub enabled: bool,
    /// Also send flood-domain probes alongside confined ones.
    pub use_flood: bool,
    /// Interval between probe rounds for each device.
    pub probe_rate_ms: u64,
    /// Consecutive unanswered rounds before a fast port is demoted.
    pub retry_ceiling: u32,
    /// A link not seen for this long is stale.
    pub stale_link_age_ms: u64,
    /// If false, stale links are only dropped when an endpoint goes away.
    pub use_stale_link_age: bool,
    /// Probes older than this are ignored. 0 = accept any age.
    pub max_discovery_delay_ms: u64,
    pub prune_interval_secs: u64,
    pub resync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name. Hashed into the probe fingerprint.
    pub name: String,
    /// Shared secret for probe signatures. Empty = unsigned probes.
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Simulated fabric description used by the daemon.
    pub path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LinkscoutConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            cluster: ClusterConfig::default(),
            suppression: None,
            fabric: FabricConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_flood: true,
            probe_rate_ms: 3000,
            retry_ceiling: 3,
            stale_link_age_ms: 10_000,
            use_stale_link_age: true,
            max_discovery_delay_ms: 1000,
            prune_interval_secs: 3,
            resync_interval_secs: 5,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "linkscout".to_string(),
            secret: String::new(),
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            path: config_dir().join("fabric.toml"),
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_rate(&self) -> Duration {
        Duration::from_millis(self.probe_rate_ms.max(1))
    }

    pub fn stale_link_age(&self) -> Duration {
        Duration::from_millis(self.stale_link_age_ms)
    }

    pub fn max_discovery_delay(&self) -> Option<Duration> {
        match self.max_discovery_delay_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("linkscout")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LinkscoutConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            LinkscoutConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LINKSCOUT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LinkscoutConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply LINKSCOUT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LINKSCOUT_DISCOVERY__ENABLED") {
            self.discovery.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("LINKSCOUT_DISCOVERY__USE_FLOOD") {
            self.discovery.use_flood = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("LINKSCOUT_DISCOVERY__PROBE_RATE_MS") {
            if let Ok(ms) = v.parse() {
                self.discovery.probe_rate_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("LINKSCOUT_DISCOVERY__STALE_LINK_AGE_MS") {
            if let Ok(ms) = v.parse() {
                self.discovery.stale_link_age_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("LINKSCOUT_DISCOVERY__USE_STALE_LINK_AGE") {
            self.discovery.use_stale_link_age = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("LINKSCOUT_CLUSTER__NAME") {
            self.cluster.name = v;
        }
        if let Ok(v) = std::env::var("LINKSCOUT_CLUSTER__SECRET") {
            self.cluster.secret = v;
        }
        if let Ok(v) = std::env::var("LINKSCOUT_FABRIC__PATH") {
            self.fabric.path = PathBuf::from(v);
        }
    }
}
