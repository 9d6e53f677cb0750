//! Per-domain cache policy.
//!
//! Profiles are configuration data: loaded once when the engine starts and
//! never mutated afterwards. A domain without a profile uses the defaults.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cache::mb_to_bytes;

/// Whether a dashboard should refresh when it is first shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOnMount {
  Always,
  /// Only when the newest cached entry is older than the cache duration
  #[default]
  IfStale,
  Never,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DomainProfile {
  /// Age after which cached entries are stale
  #[serde(default = "default_cache_duration_secs")]
  pub cache_duration_secs: u64,
  /// Soft cap for this domain, consulted during eviction. Unset means the
  /// domain is only bound by the global cap.
  #[serde(default)]
  pub max_cache_size_mb: Option<f64>,
  #[serde(default)]
  pub sync_on_mount: SyncOnMount,
}

fn default_cache_duration_secs() -> u64 {
  300
}

impl Default for DomainProfile {
  fn default() -> Self {
    Self {
      cache_duration_secs: default_cache_duration_secs(),
      max_cache_size_mb: None,
      sync_on_mount: SyncOnMount::default(),
    }
  }
}

impl DomainProfile {
  pub fn cache_duration(&self) -> Duration {
    Duration::seconds(self.cache_duration_secs.min(i64::MAX as u64) as i64)
  }

  pub fn max_cache_bytes(&self) -> Option<u64> {
    self.max_cache_size_mb.map(mb_to_bytes)
  }
}

/// Read-only lookup of domain profiles.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
  defaults: DomainProfile,
  profiles: HashMap<String, DomainProfile>,
}

impl ProfileRegistry {
  pub fn new(defaults: DomainProfile, profiles: HashMap<String, DomainProfile>) -> Self {
    Self { defaults, profiles }
  }

  /// Profile for `domain`, or the defaults when none is configured.
  pub fn get(&self, domain: &str) -> &DomainProfile {
    self.profiles.get(domain).unwrap_or(&self.defaults)
  }
}
