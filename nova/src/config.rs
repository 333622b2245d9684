//! Configuration management for nova.
//!
//! Configuration is loaded from multiple sources with precedence:
//! 1. Command-line flags (`--db`, `--owner`)
//! 2. Config file (`NOVA_CONFIG`, else `<data dir>/config.toml`)
//! 3. Default values

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use nova_memory::EngineConfig;
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Owner used when `--owner` is not given
    pub owner: String,

    /// Engine settings; `engine.database_path` is relative to the data dir
    /// unless absolute
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            engine: EngineConfig::new(default_data_dir().join("nova.db")),
        }
    }
}

/// Get the default data directory.
fn default_data_dir() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("dev", "nova", "nova") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nova")
    }
}

fn default_owner() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string())
}

impl Config {
    /// Load configuration from the config file, or defaults if it is missing.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut config: Config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Config::default()
        };

        if config.engine.database_path.is_relative() {
            let base = config_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(default_data_dir);
            config.engine.database_path = base.join(&config.engine.database_path);
        }

        Ok(config)
    }

    /// Apply command-line overrides and validate the engine section.
    pub fn with_overrides(mut self, db: Option<PathBuf>, owner: Option<String>) -> Result<Self> {
        if let Some(db) = db {
            self.engine.database_path = db;
        }
        if let Some(owner) = owner {
            self.owner = owner;
        }
        self.engine.validate().context("Invalid engine configuration")?;
        Ok(self)
    }

    /// Create the database's parent directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.engine.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        Ok(())
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("NOVA_CONFIG") {
            PathBuf::from(path)
        } else {
            default_data_dir().join("config.toml")
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
