use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{mb_to_bytes, StoreConfig};
use crate::profile::{DomainProfile, ProfileRegistry};
use crate::sync::DEFAULT_SYNC_TIMEOUT;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub remote: RemoteConfig,
  /// Profile for domains not listed under `domains`
  #[serde(default)]
  pub defaults: DomainProfile,
  #[serde(default)]
  pub domains: HashMap<String, DomainProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/dashcache/cache.db)
  pub path: Option<PathBuf>,
  #[serde(default = "default_global_max_mb")]
  pub global_max_mb: f64,
  /// Keep the cache in memory only
  #[serde(default)]
  pub in_memory: bool,
}

fn default_global_max_mb() -> f64 {
  100.0
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      global_max_mb: default_global_max_mb(),
      in_memory: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  DEFAULT_SYNC_TIMEOUT.as_secs()
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
  /// Base URL dashboards are fetched from
  pub base_url: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./dashcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dashcache/config.yaml
  ///
  /// Without any file the built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("dashcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("dashcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn store_config(&self) -> StoreConfig {
    StoreConfig {
      path: self.storage.path.clone(),
      in_memory: self.storage.in_memory,
      global_max_bytes: mb_to_bytes(self.storage.global_max_mb),
    }
  }

  pub fn profiles(&self) -> ProfileRegistry {
    ProfileRegistry::new(self.defaults.clone(), self.domains.clone())
  }

  pub fn sync_timeout(&self) -> Duration {
    Duration::from_secs(self.sync.timeout_secs)
  }

  /// Remote base URL.
  ///
  /// Checks DASHCACHE_REMOTE_URL first, then `remote.base_url`.
  pub fn remote_url(&self) -> Result<String> {
    std::env::var("DASHCACHE_REMOTE_URL")
      .ok()
      .or_else(|| self.remote.base_url.clone())
      .ok_or_else(|| {
        eyre!("No remote configured. Set remote.base_url or the DASHCACHE_REMOTE_URL environment variable.")
      })
  }
}
