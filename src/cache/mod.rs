//! Persistent cache for dashboard data.
//!
//! This module provides a domain-scoped cache that:
//! - Stores opaque serializable payloads keyed by (domain, endpoint)
//! - Tracks write times for staleness and "last updated" display
//! - Keeps estimated usage under a global cap and per-domain caps by evicting
//!   the oldest entries of the domain being written

pub mod quota;
pub mod store;
mod types;

pub use quota::{EvictionReport, QuotaEnforcer};
pub use store::{DashboardStore, StoreConfig, LAST_CLEANUP_KEY, LAST_EVICTION_KEY};
pub use types::{
  bytes_to_mb, cache_key, mb_to_bytes, CacheEntry, CacheResult, CacheSource, DomainEntry,
  DomainStats, ENTRY_VERSION,
};
