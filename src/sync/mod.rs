//! Refreshing cached dashboards from the network.
//!
//! The [`SyncManager`] decides when a domain should be refreshed, makes sure
//! at most one fetch per domain is in flight, writes results back through the
//! [`DashboardStore`](crate::cache::DashboardStore), and flushes the offline
//! queue when connectivity returns.

mod manager;
mod remote;

pub use manager::{
  Connectivity, MutationOutcome, ReconnectReport, SyncManager, SyncOptions, SyncReport, SyncState,
  DEFAULT_SYNC_TIMEOUT,
};
pub use remote::{DashboardData, HttpRemote, RemoteSource};
