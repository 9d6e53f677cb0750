//! Quota enforcement for the dashboard cache.
//!
//! Runs inside the write transaction of every `put`, before the new value is
//! committed. Eviction is a soft, single-pass policy: it removes the oldest
//! fifth of the domain being written and then lets the write through even if
//! usage is still above the cap.
//!
//! Only the domain being written is ever evicted. A domain that grows evicts
//! itself and never touches data cached for quieter domains; a global LRU
//! would spread the cost but is not implemented here.

use rusqlite::{params, Connection, OptionalExtension};

use super::types::cache_key;

use crate::error::Result;

/// Share of a domain's entries dropped per eviction pass.
const EVICTION_DIVISOR: usize = 5;

/// Outcome of a single enforcement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
  /// Keys removed, oldest first
  pub evicted: Vec<String>,
  /// Projected total (including the incoming entry) before eviction
  pub projected_before: u64,
  /// Projected total (including the incoming entry) after eviction
  pub projected_after: u64,
  /// Usage is still over a cap after the pass; the write proceeds anyway
  pub still_over: bool,
}

impl EvictionReport {
  pub fn triggered(&self) -> bool {
    !self.evicted.is_empty() || self.still_over
  }
}

/// Keeps estimated cache usage under the global and per-domain caps.
#[derive(Debug, Clone, Copy)]
pub struct QuotaEnforcer {
  global_max_bytes: u64,
}

/// Sizes used to decide whether a write needs eviction.
struct Usage {
  total: u64,
  domain: u64,
  replaced: u64,
}

impl QuotaEnforcer {
  pub fn new(global_max_bytes: u64) -> Self {
    Self { global_max_bytes }
  }

  pub fn global_max_bytes(&self) -> u64 {
    self.global_max_bytes
  }

  /// Make room for `incoming_bytes` about to be written to (`domain`, `endpoint`).
  ///
  /// `conn` should be the open write transaction so that eviction and the
  /// write commit or roll back together.
  pub fn enforce(
    &self,
    conn: &Connection,
    domain: &str,
    endpoint: &str,
    incoming_bytes: u64,
    domain_max_bytes: u64,
  ) -> Result<EvictionReport> {
    let before = usage(conn, domain, endpoint)?;
    let projected_before = project(before.total, before.replaced, incoming_bytes);

    if !self.is_over(&before, incoming_bytes, domain_max_bytes) {
      return Ok(EvictionReport {
        projected_before,
        projected_after: projected_before,
        ..Default::default()
      });
    }

    let evicted = evict_oldest(conn, domain)?;

    let after = usage(conn, domain, endpoint)?;
    let projected_after = project(after.total, after.replaced, incoming_bytes);
    let still_over = self.is_over(&after, incoming_bytes, domain_max_bytes);

    Ok(EvictionReport {
      evicted,
      projected_before,
      projected_after,
      still_over,
    })
  }

  fn is_over(&self, usage: &Usage, incoming_bytes: u64, domain_max_bytes: u64) -> bool {
    let total = project(usage.total, usage.replaced, incoming_bytes);
    let domain = project(usage.domain, usage.replaced, incoming_bytes);
    total >= self.global_max_bytes || domain > domain_max_bytes
  }
}

fn project(current: u64, replaced: u64, incoming: u64) -> u64 {
  current.saturating_sub(replaced).saturating_add(incoming)
}

fn usage(conn: &Connection, domain: &str, endpoint: &str) -> Result<Usage> {
  let total: i64 = conn.query_row(
    "SELECT COALESCE(SUM(size_bytes), 0) FROM dashboards",
    [],
    |row| row.get(0),
  )?;
  let domain_total: i64 = conn.query_row(
    "SELECT COALESCE(SUM(size_bytes), 0) FROM dashboards WHERE domain = ?",
    params![domain],
    |row| row.get(0),
  )?;
  let replaced: Option<i64> = conn
    .query_row(
      "SELECT size_bytes FROM dashboards WHERE domain = ? AND endpoint = ?",
      params![domain, endpoint],
      |row| row.get(0),
    )
    .optional()?;

  Ok(Usage {
    total: total.max(0) as u64,
    domain: domain_total.max(0) as u64,
    replaced: replaced.unwrap_or(0).max(0) as u64,
  })
}

/// Delete the oldest fifth (rounded down) of `domain`'s entries.
///
/// Returns the display keys of the removed entries, oldest first.
fn evict_oldest(conn: &Connection, domain: &str) -> Result<Vec<String>> {
  let mut stmt = conn.prepare(
    "SELECT endpoint FROM dashboards WHERE domain = ? ORDER BY timestamp ASC, endpoint ASC",
  )?;
  let endpoints = stmt
    .query_map(params![domain], |row| row.get::<_, String>(0))?
    .collect::<std::result::Result<Vec<_>, _>>()?;
  drop(stmt);

  let count = endpoints.len() / EVICTION_DIVISOR;
  let mut evicted = Vec::with_capacity(count);

  for endpoint in endpoints.into_iter().take(count) {
    conn.execute(
      "DELETE FROM dashboards WHERE domain = ? AND endpoint = ?",
      params![domain, endpoint],
    )?;
    evicted.push(cache_key(domain, &endpoint));
  }

  Ok(evicted)
}
