use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::project_dirs;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// sqlite URL; the user data directory is used when unset.
    pub database_url: Option<String>,
    pub log_filter: String,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Name given to episodes the source reports without one.
    pub blank_name: String,
    pub grace_period_days: i64,
    pub max_interval_days: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self { database_url: None, log_filter: "info".to_string(), sync: SyncConfig::default() }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { blank_name: "Untitled".to_string(), grace_period_days: 1, max_interval_days: 28 }
    }
}

impl Config {
    /// Reads `path`, or `<config dir>/config.toml` when present, then applies
    /// `RESHELF_DATABASE_URL` / `RESHELF_LOG` from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };
        let mut cfg = match path {
            Some(p) => Self::from_toml(&std::fs::read_to_string(&p)?)?,
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.sync.validate()?;
        Ok(cfg)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("RESHELF_DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(filter) = lookup("RESHELF_LOG").filter(|v| !v.trim().is_empty()) {
            self.log_filter = filter;
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_interval_days < 1 {
            return Err(Error::Config(format!("sync.max_interval_days must be at least 1, got {}", self.max_interval_days)));
        }
        if self.grace_period_days < 0 {
            return Err(Error::Config(format!("sync.grace_period_days must not be negative, got {}", self.grace_period_days)));
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    project_dirs().ok().map(|d| d.config_dir().join("config.toml"))
}
