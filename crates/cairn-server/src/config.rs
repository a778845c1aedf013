//! Server configuration.

use anyhow::Result;
use cairn_core::{CheckpointManagerConfig, MergePolicy, DEFAULT_MAX_UNTRACKED_BYTES};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Repository for sessions whose start event carries no project directory.
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
    #[serde(default)]
    pub restore: RestoreConfig,
}

/// `[restore]` table: how snapshots are materialized.
#[derive(Debug, Clone, Deserialize)]
pub struct RestoreConfig {
    #[serde(default = "default_remove_tracked_absent")]
    pub remove_tracked_absent: bool,
    #[serde(default = "default_max_untracked_bytes")]
    pub max_untracked_bytes: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8470
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cairn")
        .join("checkpoints.db")
}

fn default_remove_tracked_absent() -> bool {
    true
}

fn default_max_untracked_bytes() -> u64 {
    DEFAULT_MAX_UNTRACKED_BYTES
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            remove_tracked_absent: default_remove_tracked_absent(),
            max_untracked_bytes: default_max_untracked_bytes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            project_dir: None,
            restore: RestoreConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a specific file path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from default location (config/default.toml) or fall back to defaults.
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from("config/default.toml");
        if config_path.exists() {
            return Self::load_from(&config_path);
        }

        Ok(Config::default())
    }

    pub fn manager_config(&self) -> CheckpointManagerConfig {
        CheckpointManagerConfig {
            db_path: self.db_path.clone(),
            default_project_dir: self.project_dir.clone(),
            merge_policy: MergePolicy {
                remove_tracked_absent: self.restore.remove_tracked_absent,
            },
            max_untracked_bytes: self.restore.max_untracked_bytes,
        }
    }
}
