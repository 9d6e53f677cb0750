//! Core types for cached dashboard data.

use chrono::{DateTime, Utc};

/// Payload format version written by this build.
///
/// Entries stored under any other version are treated as cache misses.
pub const ENTRY_VERSION: u32 = 1;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Human readable label for a (domain, endpoint) pair, used in logs and
/// eviction reports.
///
/// Not unique: `("a", "b:c")` and `("a:b", "c")` share a label. Rows are
/// stored and looked up by the pair itself.
pub fn cache_key(domain: &str, endpoint: &str) -> String {
  format!("{}:{}", domain, endpoint)
}

pub fn mb_to_bytes(mb: f64) -> u64 {
  (mb.max(0.0) * BYTES_PER_MB as f64) as u64
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
  bytes as f64 / BYTES_PER_MB as f64
}

/// A cached response for one (domain, endpoint) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  /// Display label from [`cache_key`]
  pub key: String,
  pub domain: String,
  pub endpoint: String,
  pub data: T,
  /// When the entry was written
  pub timestamp: DateTime<Utc>,
  pub version: u32,
}

/// One endpoint's payload as returned by a domain listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEntry<T> {
  pub endpoint: String,
  pub data: T,
  pub timestamp: DateTime<Utc>,
}

/// Size and recency summary for a single domain.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainStats {
  pub domain: String,
  pub entries: usize,
  pub bytes: u64,
  pub last_update: Option<DateTime<Utc>>,
}

/// Result from a cache-first read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale and no refresh attempted
  CacheStale,
  /// Network unavailable or failed, serving cached data
  Offline,
}
