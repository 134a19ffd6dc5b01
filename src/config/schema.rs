//! Configuration schema for Nitrate
//!
//! Configuration is stored at `~/.config/nitrate/config.toml`

use crate::cache::{CacheLevel, Expiration, ExpirationPolicy, DEFAULT_EXPIRATION, IMMUTABLE_EXPIRATION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache level and file
    pub cache: CacheConfig,

    /// Multicall batching
    pub batch: BatchConfig,

    /// Remote call settings
    pub rpc: RpcConfig,

    /// Per-class time-to-live
    pub expiration: ExpirationConfig,
}

impl Config {
    /// Check values serde cannot
    pub fn validate(&self) -> Result<(), String> {
        if self.batch.max_calls == 0 {
            return Err("batch.max_calls must be at least 1".to_string());
        }
        match self.general.log_format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(format!(
                "general.log_format must be \"text\" or \"json\", not \"{}\"",
                other
            )),
        }
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 0 none, 1 changes, 2 objects, 3 persistent
    pub level: CacheLevel,

    /// Cache file used at level 3
    pub file: Option<PathBuf>,
}

impl CacheConfig {
    pub fn default_file() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nitrate")
            .join("cache.json.gz")
    }

    /// Configured cache file, or the default location
    pub fn file_path(&self) -> PathBuf {
        self.file.clone().unwrap_or_else(Self::default_file)
    }
}

/// Batch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Most calls sent in one multicall
    pub max_calls: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_calls: 10 }
    }
}

/// Remote call configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Per-call timeout in seconds; 0 disables it
    pub timeout_secs: u64,
}

impl RpcConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

/// Expiration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    /// TTL for classes without a more specific setting
    pub default: Expiration,

    /// TTL for immutable reference classes
    pub immutable: Expiration,

    /// Per-class overrides, keyed by class name
    pub classes: BTreeMap<String, Expiration>,
}

impl ExpirationConfig {
    pub fn policy(&self) -> ExpirationPolicy {
        ExpirationPolicy::from_table(self.default, self.immutable, &self.classes)
    }
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            default: DEFAULT_EXPIRATION,
            immutable: IMMUTABLE_EXPIRATION,
            classes: BTreeMap::new(),
        }
    }
}
