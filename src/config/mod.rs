//! Configuration management for Nitrate

pub mod schema;

pub use schema::Config;

use crate::cache::CacheLevel;
use crate::error::{NitrateError, NitrateResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nitrate")
            .join("config.toml")
    }

    /// Load configuration, using defaults if the file does not exist
    ///
    /// `NITRATE_CACHE` overrides the configured cache level.
    pub async fn load(&self) -> NitrateResult<Config> {
        let mut config = self.load_saved().await?;
        Self::apply_env(&mut config)?;
        Ok(config)
    }

    /// Load the file as written, without environment overrides
    pub async fn load_saved(&self) -> NitrateResult<Config> {
        if self.config_path.exists() {
            self.load_from_file(&self.config_path).await
        } else {
            debug!("Config file not found, using defaults");
            Ok(Config::default())
        }
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> NitrateResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| NitrateError::io(format!("reading config from {}", path.display()), e))?;

        let config: Config = toml::from_str(&content).map_err(|e| NitrateError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate().map_err(|reason| NitrateError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(config: &mut Config) -> NitrateResult<()> {
        if let Some(level) = CacheLevel::from_env() {
            let level = level?;
            debug!("Cache level {} from environment", level);
            config.cache.level = level;
        }
        Ok(())
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> NitrateResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            NitrateError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> NitrateResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| NitrateError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
