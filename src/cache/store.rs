//! Persistent store of cached dashboard responses.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::quota::{EvictionReport, QuotaEnforcer};
use super::types::{
  bytes_to_mb, cache_key, mb_to_bytes, CacheEntry, DomainEntry, DomainStats, ENTRY_VERSION,
};
use crate::clock::{Clock, SystemClock};
use crate::db::Database;
use crate::error::{CacheError, Result};
use crate::profile::ProfileRegistry;

/// Metadata key recording the last eviction pass.
pub const LAST_EVICTION_KEY: &str = "last_eviction_at";
/// Metadata key recording the last global cleanup.
pub const LAST_CLEANUP_KEY: &str = "last_cleanup_at";

/// Where and how large the store may be.
#[derive(Debug, Clone)]
pub struct StoreConfig {
  /// Database file; `None` uses the platform data directory
  pub path: Option<PathBuf>,
  /// Skip the file entirely and keep everything in memory
  pub in_memory: bool,
  /// Hard cap on the estimated size of all entries
  pub global_max_bytes: u64,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      in_memory: false,
      global_max_bytes: mb_to_bytes(100.0),
    }
  }
}

impl StoreConfig {
  /// In-memory store with the given cap, mostly for tests.
  pub fn in_memory(global_max_bytes: u64) -> Self {
    Self {
      path: None,
      in_memory: true,
      global_max_bytes,
    }
  }
}

/// Cache of dashboard payloads keyed by (domain, endpoint).
///
/// The store must be initialized with [`DashboardStore::init`] before use.
/// Every mutation path goes through the same connection lock, so a read
/// observes either the previous or the new value of an entry, never a mix.
pub struct DashboardStore {
  config: StoreConfig,
  profiles: Arc<ProfileRegistry>,
  clock: Arc<dyn Clock>,
  quota: QuotaEnforcer,
  db: Mutex<Option<Arc<Database>>>,
}

impl DashboardStore {
  pub fn new(config: StoreConfig) -> Self {
    let quota = QuotaEnforcer::new(config.global_max_bytes);
    Self {
      config,
      profiles: Arc::new(ProfileRegistry::default()),
      clock: Arc::new(SystemClock),
      quota,
      db: Mutex::new(None),
    }
  }

  /// Use these domain profiles for per-domain caps.
  pub fn with_profiles(mut self, profiles: Arc<ProfileRegistry>) -> Self {
    self.profiles = profiles;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Open the backing database. Calling this again is a no-op.
  ///
  /// If the database file cannot be opened the store falls back to an
  /// in-memory database for the rest of the session.
  pub fn init(&self) -> Result<()> {
    let mut slot = self.db.lock()?;
    if slot.is_some() {
      return Ok(());
    }

    let db = if self.config.in_memory {
      Database::open_in_memory()?
    } else {
      let opened = match self.config.path.clone().or_else(Database::default_path) {
        Some(path) => Database::open(&path),
        None => Err(CacheError::StorageUnavailable(
          "could not determine data directory".to_string(),
        )),
      };
      match opened {
        Ok(db) => {
          info!("Opened dashboard cache database");
          db
        }
        Err(e) => {
          warn!(error = %e, "Cache storage unavailable, using in-memory cache for this session");
          Database::open_in_memory()?
        }
      }
    };

    *slot = Some(Arc::new(db));
    Ok(())
  }

  /// Release the database. A later `init` opens it again.
  pub fn close(&self) -> Result<()> {
    self.db.lock()?.take();
    Ok(())
  }

  pub fn is_initialized(&self) -> bool {
    self.db.lock().map(|slot| slot.is_some()).unwrap_or(false)
  }

  /// Whether entries survive a restart (false after an in-memory fallback).
  pub fn is_persistent(&self) -> Result<bool> {
    Ok(self.database()?.is_persistent())
  }

  /// Shared handle to the open database.
  pub fn database(&self) -> Result<Arc<Database>> {
    self.db.lock()?.clone().ok_or(CacheError::NotInitialized)
  }

  pub fn profiles(&self) -> &Arc<ProfileRegistry> {
    &self.profiles
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  pub fn global_max_bytes(&self) -> u64 {
    self.quota.global_max_bytes()
  }

  /// Write `data` for (domain, endpoint), replacing any previous value.
  pub fn put<T: Serialize + ?Sized>(
    &self,
    domain: &str,
    endpoint: &str,
    data: &T,
  ) -> Result<EvictionReport> {
    self.put_versioned(domain, endpoint, data, ENTRY_VERSION)
  }

  /// Write `data` tagged with an explicit format version.
  ///
  /// Quota enforcement runs first, inside the same transaction as the
  /// write: if anything fails neither the eviction nor the new value is
  /// committed.
  pub fn put_versioned<T: Serialize + ?Sized>(
    &self,
    domain: &str,
    endpoint: &str,
    data: &T,
    version: u32,
  ) -> Result<EvictionReport> {
    let bytes = serde_json::to_vec(data)?;
    let size = bytes.len() as u64;
    let now = self.clock.now().timestamp_millis();
    let domain_max = self.domain_max_bytes(domain);

    let report = self.database()?.with_conn(|conn| {
      let tx = conn.transaction()?;
      let report = self.quota.enforce(&tx, domain, endpoint, size, domain_max)?;

      tx.execute(
        "INSERT OR REPLACE INTO dashboards (domain, endpoint, data, size_bytes, timestamp, version)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![domain, endpoint, bytes, size as i64, now, version],
      )?;

      if report.triggered() {
        write_metadata(&tx, LAST_EVICTION_KEY, &now.to_string(), now)?;
      }

      tx.commit()?;
      Ok(report)
    })?;

    if !report.evicted.is_empty() {
      info!(
        domain,
        evicted = report.evicted.len(),
        "Evicted oldest cache entries"
      );
    }
    if report.still_over {
      warn!(
        domain,
        projected_mb = bytes_to_mb(report.projected_after),
        "Cache still over quota after eviction, keeping write"
      );
    }

    Ok(report)
  }

  /// Cap for a single domain: its profile's limit, or the global cap when
  /// the profile sets none.
  pub fn domain_max_bytes(&self, domain: &str) -> u64 {
    self
      .profiles
      .get(domain)
      .max_cache_bytes()
      .unwrap_or_else(|| self.global_max_bytes())
  }

  /// Cached payload for (domain, endpoint), or `None` on a miss.
  pub fn get<T: DeserializeOwned>(&self, domain: &str, endpoint: &str) -> Result<Option<T>> {
    self.get_versioned(domain, endpoint, ENTRY_VERSION)
  }

  /// Like [`get`](Self::get), but only accepts entries written with `expected_version`.
  pub fn get_versioned<T: DeserializeOwned>(
    &self,
    domain: &str,
    endpoint: &str,
    expected_version: u32,
  ) -> Result<Option<T>> {
    Ok(
      self
        .read_entry(domain, endpoint, expected_version)?
        .map(|entry| entry.data),
    )
  }

  /// Full cached entry including timestamp and version.
  pub fn get_entry<T: DeserializeOwned>(
    &self,
    domain: &str,
    endpoint: &str,
  ) -> Result<Option<CacheEntry<T>>> {
    self.read_entry(domain, endpoint, ENTRY_VERSION)
  }

  fn read_entry<T: DeserializeOwned>(
    &self,
    domain: &str,
    endpoint: &str,
    expected_version: u32,
  ) -> Result<Option<CacheEntry<T>>> {
    let key = cache_key(domain, endpoint);

    let row: Option<(Vec<u8>, i64, u32)> = self.database()?.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT data, timestamp, version FROM dashboards WHERE domain = ? AND endpoint = ?",
            params![domain, endpoint],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
          )
          .optional()?,
      )
    })?;

    let Some((bytes, timestamp, version)) = row else {
      return Ok(None);
    };

    if version != expected_version {
      debug!(key = %key, version, expected_version, "Cache entry version mismatch");
      return Ok(None);
    }

    match serde_json::from_slice(&bytes) {
      Ok(data) => Ok(Some(CacheEntry {
        key,
        domain: domain.to_string(),
        endpoint: endpoint.to_string(),
        data,
        timestamp: from_millis(timestamp),
        version,
      })),
      Err(e) => {
        debug!(key = %key, error = %e, "Cached payload does not decode, treating as miss");
        Ok(None)
      }
    }
  }

  /// All entries cached for `domain`. Order is not part of the contract.
  pub fn get_by_domain<T: DeserializeOwned>(&self, domain: &str) -> Result<Vec<DomainEntry<T>>> {
    let rows: Vec<(String, Vec<u8>, i64)> = self.database()?.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT endpoint, data, timestamp FROM dashboards
         WHERE domain = ? AND version = ?
         ORDER BY timestamp ASC",
      )?;
      let rows = stmt
        .query_map(params![domain, ENTRY_VERSION], |row| {
          Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
      Ok(rows)
    })?;

    Ok(
      rows
        .into_iter()
        .filter_map(|(endpoint, bytes, timestamp)| {
          serde_json::from_slice(&bytes)
            .ok()
            .map(|data| DomainEntry {
              endpoint,
              data,
              timestamp: from_millis(timestamp),
            })
        })
        .collect(),
    )
  }

  /// Remove one entry. Removing a missing entry is not an error.
  pub fn delete(&self, domain: &str, endpoint: &str) -> Result<usize> {
    self.database()?.with_conn(|conn| {
      Ok(conn.execute(
        "DELETE FROM dashboards WHERE domain = ? AND endpoint = ?",
        params![domain, endpoint],
      )?)
    })
  }

  pub fn delete_by_domain(&self, domain: &str) -> Result<usize> {
    self.database()?.with_conn(|conn| {
      Ok(conn.execute("DELETE FROM dashboards WHERE domain = ?", params![domain])?)
    })
  }

  /// Remove every cached entry. Metadata and the offline queue are kept.
  pub fn clear(&self) -> Result<usize> {
    self
      .database()?
      .with_conn(|conn| Ok(conn.execute("DELETE FROM dashboards", [])?))
  }

  /// True when the entry is missing or older than `max_age`.
  pub fn is_stale(&self, domain: &str, endpoint: &str, max_age: Duration) -> Result<bool> {
    let timestamp: Option<i64> = self.database()?.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT timestamp FROM dashboards WHERE domain = ? AND endpoint = ? AND version = ?",
            params![domain, endpoint, ENTRY_VERSION],
            |row| row.get(0),
          )
          .optional()?,
      )
    })?;

    Ok(match timestamp {
      Some(ts) => self.clock.now() - from_millis(ts) > max_age,
      None => true,
    })
  }

  /// Newest write time across the domain's entries.
  pub fn get_last_update_time(&self, domain: &str) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<i64> = self.database()?.with_conn(|conn| {
      Ok(conn.query_row(
        "SELECT MAX(timestamp) FROM dashboards WHERE domain = ?",
        params![domain],
        |row| row.get(0),
      )?)
    })?;
    Ok(latest.map(from_millis))
  }

  /// Estimated size of all cached payloads in bytes.
  ///
  /// Counts encoded payload length only; SQLite's own storage overhead is
  /// not included, so the real file is larger.
  pub fn estimate_size_bytes(&self) -> Result<u64> {
    let total: i64 = self.database()?.with_conn(|conn| {
      Ok(conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM dashboards",
        [],
        |row| row.get(0),
      )?)
    })?;
    Ok(total.max(0) as u64)
  }

  /// Estimated size of all cached payloads in megabytes. Approximate, see
  /// [`estimate_size_bytes`](Self::estimate_size_bytes).
  pub fn estimate_size_mb(&self) -> Result<f64> {
    Ok(bytes_to_mb(self.estimate_size_bytes()?))
  }

  /// Per-domain entry counts, sizes and last update times.
  pub fn stats(&self) -> Result<Vec<DomainStats>> {
    self.database()?.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT domain, COUNT(*), COALESCE(SUM(size_bytes), 0), MAX(timestamp)
         FROM dashboards GROUP BY domain ORDER BY domain",
      )?;
      let stats = stmt
        .query_map([], |row| {
          let entries: i64 = row.get(1)?;
          let bytes: i64 = row.get(2)?;
          let last: Option<i64> = row.get(3)?;
          Ok(DomainStats {
            domain: row.get(0)?,
            entries: entries.max(0) as usize,
            bytes: bytes.max(0) as u64,
            last_update: last.map(from_millis),
          })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
      Ok(stats)
    })
  }

  /// Delete entries in every domain older than `max_age`.
  pub fn prune_older_than(&self, max_age: Duration) -> Result<usize> {
    let now = self.clock.now();
    let cutoff = (now - max_age).timestamp_millis();
    let now_ms = now.timestamp_millis();

    let removed = self.database()?.with_conn(|conn| {
      let tx = conn.transaction()?;
      let removed = tx.execute("DELETE FROM dashboards WHERE timestamp < ?", params![cutoff])?;
      write_metadata(&tx, LAST_CLEANUP_KEY, &now_ms.to_string(), now_ms)?;
      tx.commit()?;
      Ok(removed)
    })?;

    if removed > 0 {
      info!(removed, "Pruned expired cache entries");
    }
    Ok(removed)
  }

  pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
    self.database()?.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT value FROM metadata WHERE key = ?",
            params![key],
            |row| row.get(0),
          )
          .optional()?,
      )
    })
  }

  pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
    let now = self.clock.now().timestamp_millis();
    self
      .database()?
      .with_conn(|conn| write_metadata(conn, key, value, now))
  }

  /// Timestamp stored under a metadata key written by the store itself.
  pub fn metadata_time(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(
      self
        .get_metadata(key)?
        .and_then(|v| v.parse::<i64>().ok())
        .map(from_millis),
    )
  }
}

fn write_metadata(conn: &Connection, key: &str, value: &str, now: i64) -> Result<()> {
  conn.execute(
    "INSERT OR REPLACE INTO metadata (key, value, updated_at) VALUES (?, ?, ?)",
    params![key, value, now],
  )?;
  Ok(())
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
