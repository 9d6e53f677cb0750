//! Offline-first cache and sync engine for dashboard data.
//!
//! - [`cache::DashboardStore`] persists payloads per (domain, endpoint) and
//!   keeps usage under quota
//! - [`profile::ProfileRegistry`] holds per-domain cache policy
//! - [`queue::OfflineQueue`] keeps mutations made while offline
//! - [`sync::SyncManager`] refreshes domains from the network, one fetch per
//!   domain at a time, and flushes the queue on reconnect

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod logging;
pub mod profile;
pub mod queue;
pub mod sync;

pub use error::{CacheError, Result, SyncError};
