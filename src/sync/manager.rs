//! Sync orchestration with per-domain deduplication.

use chrono::{DateTime, Utc};
use color_eyre::eyre::eyre;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::remote::{DashboardData, RemoteSource};
use crate::cache::{CacheResult, CacheSource, DashboardStore, DomainEntry};
use crate::error::{CacheError, SyncError};
use crate::event::{EventBus, SyncEvent};
use crate::profile::SyncOnMount;
use crate::queue::{DrainReport, OfflineQueue, Operation};

/// Upper bound on a single fetch or replay.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(15);

/// Online/offline signal from the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Per-domain sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Syncing,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
  /// Sync even if cached data is still fresh
  pub force: bool,
}

impl SyncOptions {
  pub fn forced() -> Self {
    Self { force: true }
  }
}

/// Outcome of a sync, shared by every caller that joined it.
///
/// On failure `entries` holds the last known good data and `error` says why
/// the refresh did not happen.
#[derive(Debug, Clone)]
pub struct SyncReport {
  pub domain: String,
  pub entries: Vec<DomainEntry<Value>>,
  pub source: CacheSource,
  pub last_updated: Option<DateTime<Utc>>,
  pub error: Option<SyncError>,
}

impl SyncReport {
  pub fn is_ok(&self) -> bool {
    self.error.is_none()
  }
}

/// What happened to a mutation submitted through [`SyncManager::mutate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
  /// Sent to the remote immediately
  Applied,
  /// Stored in the offline queue under this id
  Queued(i64),
}

/// Result of the reconnect routine.
#[derive(Debug, Clone, Default)]
pub struct ReconnectReport {
  pub drain: DrainReport,
  /// Forced syncs of every domain that had mutations replayed
  pub synced: Vec<SyncReport>,
  pub error: Option<SyncError>,
}

type SharedSync = Shared<BoxFuture<'static, SyncReport>>;

/// A running sync and the id it was registered under.
struct InFlight {
  id: u64,
  sync: SharedSync,
}

struct Inner {
  store: Arc<DashboardStore>,
  queue: Arc<OfflineQueue>,
  remote: Arc<dyn RemoteSource>,
  events: EventBus,
  in_flight: Mutex<HashMap<String, InFlight>>,
  next_sync_id: AtomicU64,
  last_errors: Mutex<HashMap<String, SyncError>>,
  online: AtomicBool,
}

/// Coordinates network refreshes for all domains.
///
/// Cloning is cheap and clones share in-flight state.
#[derive(Clone)]
pub struct SyncManager {
  inner: Arc<Inner>,
  timeout: Duration,
}

impl SyncManager {
  pub fn new(
    store: Arc<DashboardStore>,
    queue: Arc<OfflineQueue>,
    remote: Arc<dyn RemoteSource>,
    events: EventBus,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        queue,
        remote,
        events,
        in_flight: Mutex::new(HashMap::new()),
        next_sync_id: AtomicU64::new(0),
        last_errors: Mutex::new(HashMap::new()),
        online: AtomicBool::new(true),
      }),
      timeout: DEFAULT_SYNC_TIMEOUT,
    }
  }

  /// Set the timeout for fetches and replays.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn store(&self) -> &Arc<DashboardStore> {
    &self.inner.store
  }

  pub fn queue(&self) -> &Arc<OfflineQueue> {
    &self.inner.queue
  }

  pub fn events(&self) -> &EventBus {
    &self.inner.events
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  /// Record connectivity without running the reconnect routine.
  pub fn set_connectivity(&self, state: Connectivity) {
    self
      .inner
      .online
      .store(state == Connectivity::Online, Ordering::SeqCst);
  }

  pub fn state(&self, domain: &str) -> SyncState {
    if lock(&self.inner.in_flight).contains_key(domain) {
      SyncState::Syncing
    } else {
      SyncState::Idle
    }
  }

  /// Error from the most recent failed sync of `domain`, cleared on success.
  pub fn last_error(&self, domain: &str) -> Option<SyncError> {
    lock(&self.inner.last_errors).get(domain).cloned()
  }

  /// True when the domain has no entries or its newest entry is older than
  /// the domain's cache duration.
  pub fn is_domain_stale(&self, domain: &str) -> Result<bool, CacheError> {
    let store = &self.inner.store;
    let max_age = store.profiles().get(domain).cache_duration();
    Ok(match store.get_last_update_time(domain)? {
      Some(updated) => store.clock().now() - updated > max_age,
      None => true,
    })
  }

  /// Apply the domain's mount policy.
  pub fn should_sync_on_mount(&self, domain: &str) -> bool {
    match self.inner.store.profiles().get(domain).sync_on_mount {
      SyncOnMount::Always => true,
      SyncOnMount::Never => false,
      SyncOnMount::IfStale => self.is_domain_stale(domain).unwrap_or_else(|e| {
        warn!(domain, error = %e, "Could not read cache age, treating as stale");
        true
      }),
    }
  }

  /// Refresh `domain` from the remote.
  ///
  /// If a sync of `domain` is already running this call joins it instead of
  /// starting another fetch, and resolves with the same report. Without
  /// `force`, a domain whose cache is still fresh is not fetched at all.
  ///
  /// The fetch runs on its own task: dropping the returned future does not
  /// cancel it, and its result is still committed to the cache.
  pub async fn sync_dashboard(&self, domain: &str, options: SyncOptions) -> SyncReport {
    let shared = {
      let mut in_flight = lock(&self.inner.in_flight);

      if let Some(existing) = in_flight.get(domain) {
        debug!(domain, "Joining in-flight sync");
        existing.sync.clone()
      } else {
        if !options.force {
          match self.is_domain_stale(domain) {
            Ok(false) => {
              drop(in_flight);
              return cached_report(&self.inner, domain, CacheSource::CacheFresh, None);
            }
            Ok(true) => {}
            Err(e) => warn!(domain, error = %e, "Could not read cache age, syncing anyway"),
          }
        }

        let id = self.inner.next_sync_id.fetch_add(1, Ordering::Relaxed);
        let shared = self.start_sync(domain, id);
        in_flight.insert(
          domain.to_string(),
          InFlight {
            id,
            sync: shared.clone(),
          },
        );
        shared
      }
    };

    shared.await
  }

  /// Must be called with the in-flight map locked.
  fn start_sync(&self, domain: &str, id: u64) -> SharedSync {
    let inner = Arc::clone(&self.inner);
    let timeout = self.timeout;
    let owned = domain.to_string();
    let fetch = inner.remote.fetch_dashboard(domain);

    inner.events.publish(SyncEvent::SyncStarted {
      domain: owned.clone(),
    });
    debug!(domain, "Starting sync");

    let task = {
      let inner = Arc::clone(&inner);
      let domain = owned.clone();
      tokio::spawn(async move {
        let report = run_sync(&inner, &domain, fetch, timeout).await;
        finish_in_flight(&inner, &domain, id);
        report
      })
    };

    async move {
      match task.await {
        Ok(report) => report,
        Err(e) => {
          // The task died before it could unregister itself
          finish_in_flight(&inner, &owned, id);
          let error = SyncError::NetworkSyncFailed(format!("sync task failed: {}", e));
          record_failure(&inner, &owned, &error);
          cached_report(&inner, &owned, CacheSource::Offline, Some(error))
        }
      }
    }
    .boxed()
    .shared()
  }

  /// Cache-first read of a whole domain.
  ///
  /// Fresh cache is returned as is. Stale cache is refreshed when online; if
  /// the refresh fails, or we are offline, the cached entries are returned
  /// with a source saying so.
  pub async fn load(&self, domain: &str) -> CacheResult<Vec<DomainEntry<Value>>> {
    let stale = self.is_domain_stale(domain).unwrap_or(true);

    if !stale || !self.is_online() {
      let report = cached_report(&self.inner, domain, CacheSource::CacheFresh, None);
      return CacheResult::from_cache(report.entries, report.last_updated, stale);
    }

    let report = self.sync_dashboard(domain, SyncOptions::forced()).await;
    match report.error {
      None => CacheResult {
        data: report.entries,
        source: report.source,
        cached_at: report.last_updated,
      },
      Some(_) => CacheResult::offline(report.entries, report.last_updated),
    }
  }

  /// Send a mutation now if online, otherwise queue it for the next reconnect.
  ///
  /// A mutation whose immediate send fails is queued as well.
  pub async fn mutate(
    &self,
    domain: &str,
    operation: Operation,
  ) -> Result<MutationOutcome, CacheError> {
    if self.is_online() {
      let send = self.inner.remote.replay(domain, &operation);
      match tokio::time::timeout(self.timeout, send).await {
        Ok(Ok(())) => return Ok(MutationOutcome::Applied),
        Ok(Err(e)) => warn!(domain, error = %e, "Mutation failed, queueing for later"),
        Err(_) => warn!(domain, "Mutation timed out, queueing for later"),
      }
    }

    let id = self.inner.queue.enqueue(domain, operation)?;
    Ok(MutationOutcome::Queued(id))
  }

  /// Replay the offline queue through the remote.
  pub async fn drain_queue(&self) -> Result<DrainReport, CacheError> {
    let remote = Arc::clone(&self.inner.remote);
    let timeout = self.timeout;

    self
      .inner
      .queue
      .drain(|item| {
        let send = remote.replay(&item.domain, &item.operation);
        async move {
          match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(eyre!("replay timed out after {:?}", timeout)),
          }
        }
      })
      .await
  }

  /// Connectivity is back: flush queued mutations, then force a sync of
  /// every domain that had mutations replayed.
  pub async fn on_reconnect(&self) -> ReconnectReport {
    self.set_connectivity(Connectivity::Online);
    self.inner.events.publish(SyncEvent::Online);
    info!("Connectivity restored, draining offline queue");

    let mut report = ReconnectReport::default();

    match self.drain_queue().await {
      Ok(drain) => report.drain = drain,
      Err(e) => {
        warn!(error = %e, "Failed to drain offline queue");
        report.error = Some(e.into());
        return report;
      }
    }

    for domain in report.drain.replayed_domains() {
      let synced = self.sync_dashboard(&domain, SyncOptions::forced()).await;
      report.synced.push(synced);
    }

    let failed = report.drain.failure_count();
    if failed > 0 {
      report.error = Some(SyncError::QueueReplayFailed { failed });
    }

    report
  }

  /// Follow a connectivity signal, running [`on_reconnect`](Self::on_reconnect)
  /// on every offline to online transition.
  ///
  /// If the signal starts out online and mutations are already queued (left
  /// over from a previous session), they are replayed straight away. Starting
  /// out offline publishes [`SyncEvent::Offline`].
  pub fn watch_connectivity(&self, mut rx: watch::Receiver<Connectivity>) -> JoinHandle<()> {
    let manager = self.clone();

    tokio::spawn(async move {
      let initial = *rx.borrow_and_update();
      manager.set_connectivity(initial);
      if initial == Connectivity::Offline {
        manager.events().publish(SyncEvent::Offline);
        info!("Starting offline, mutations will be queued");
      }

      let pending = manager.queue().size().unwrap_or(0);
      if initial == Connectivity::Online && pending > 0 {
        manager.on_reconnect().await;
      }

      while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        let was_online = manager.is_online();

        match state {
          Connectivity::Online if !was_online => {
            manager.on_reconnect().await;
          }
          Connectivity::Offline if was_online => {
            manager.set_connectivity(Connectivity::Offline);
            manager.events().publish(SyncEvent::Offline);
            info!("Connectivity lost, mutations will be queued");
          }
          _ => {}
        }
      }
    })
  }
}

async fn run_sync(
  inner: &Inner,
  domain: &str,
  fetch: BoxFuture<'static, color_eyre::Result<DashboardData>>,
  timeout: Duration,
) -> SyncReport {
  let result = match tokio::time::timeout(timeout, fetch).await {
    Ok(Ok(data)) => Ok(data),
    Ok(Err(e)) => Err(SyncError::NetworkSyncFailed(e.to_string())),
    Err(_) => Err(SyncError::Timeout(timeout)),
  };

  let data = match result {
    Ok(data) => data,
    Err(error) => {
      warn!(domain, error = %error, "Sync failed, keeping cached data");
      record_failure(inner, domain, &error);
      return cached_report(inner, domain, CacheSource::Offline, Some(error));
    }
  };

  for (endpoint, value) in &data {
    // The cache is a convenience layer, so a failed write is only logged
    if let Err(e) = inner.store.put(domain, endpoint, value) {
      warn!(domain, endpoint = %endpoint, error = %e, "Failed to cache synced data");
    }
  }

  lock(&inner.last_errors).remove(domain);
  inner.events.publish(SyncEvent::SyncCompleted {
    domain: domain.to_string(),
    entries: data.len(),
  });
  info!(domain, entries = data.len(), "Sync completed");

  let now = inner.store.clock().now();
  SyncReport {
    domain: domain.to_string(),
    entries: data
      .into_iter()
      .map(|(endpoint, data)| DomainEntry {
        endpoint,
        data,
        timestamp: now,
      })
      .collect(),
    source: CacheSource::Network,
    last_updated: Some(now),
    error: None,
  }
}

/// Unregister sync `id` of `domain`, leaving any newer sync in place.
fn finish_in_flight(inner: &Inner, domain: &str, id: u64) {
  let mut in_flight = lock(&inner.in_flight);
  if in_flight.get(domain).is_some_and(|f| f.id == id) {
    in_flight.remove(domain);
  }
}

fn record_failure(inner: &Inner, domain: &str, error: &SyncError) {
  lock(&inner.last_errors).insert(domain.to_string(), error.clone());
  inner.events.publish(SyncEvent::SyncFailed {
    domain: domain.to_string(),
    error: error.clone(),
  });
}

/// Report built from whatever is currently cached for `domain`.
fn cached_report(
  inner: &Inner,
  domain: &str,
  source: CacheSource,
  error: Option<SyncError>,
) -> SyncReport {
  let entries = inner
    .store
    .get_by_domain::<Value>(domain)
    .unwrap_or_else(|e| {
      warn!(domain, error = %e, "Failed to read cached entries");
      Vec::new()
    });
  let last_updated = inner.store.get_last_update_time(domain).ok().flatten();

  SyncReport {
    domain: domain.to_string(),
    entries,
    source,
    last_updated,
    error,
  }
}

/// The maps guarded here stay consistent even if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::StoreConfig;
  use crate::clock::ManualClock;
  use crate::profile::{DomainProfile, ProfileRegistry};
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct FakeState {
    fetches: AtomicUsize,
    fail_fetch: AtomicBool,
    panic_fetch: AtomicBool,
    fail_replay_target: Mutex<Option<String>>,
    replayed: Mutex<Vec<String>>,
    data: Mutex<DashboardData>,
  }

  struct FakeRemote {
    state: Arc<FakeState>,
    delay: Duration,
  }

  impl RemoteSource for FakeRemote {
    fn fetch_dashboard(&self, _domain: &str) -> BoxFuture<'static, color_eyre::Result<DashboardData>> {
      self.state.fetches.fetch_add(1, Ordering::SeqCst);
      let state = Arc::clone(&self.state);
      let delay = self.delay;
      Box::pin(async move {
        tokio::time::sleep(delay).await;
        if state.panic_fetch.load(Ordering::SeqCst) {
          panic!("remote client bug");
        }
        if state.fail_fetch.load(Ordering::SeqCst) {
          return Err(eyre!("connection refused"));
        }
        Ok(state.data.lock().unwrap().clone())
      })
    }

    fn replay(&self, _domain: &str, operation: &Operation) -> BoxFuture<'static, color_eyre::Result<()>> {
      let state = Arc::clone(&self.state);
      let target = operation.target.clone();
      Box::pin(async move {
        if state.fail_replay_target.lock().unwrap().as_deref() == Some(target.as_str()) {
          return Err(eyre!("rejected"));
        }
        state.replayed.lock().unwrap().push(target);
        Ok(())
      })
    }
  }

  struct Harness {
    manager: SyncManager,
    state: Arc<FakeState>,
    clock: Arc<ManualClock>,
  }

  fn harness(delay: Duration) -> Harness {
    let mut profiles = HashMap::new();
    profiles.insert(
      "grid".to_string(),
      DomainProfile {
        cache_duration_secs: 60,
        sync_on_mount: SyncOnMount::IfStale,
        ..Default::default()
      },
    );
    profiles.insert(
      "medical".to_string(),
      DomainProfile {
        sync_on_mount: SyncOnMount::Always,
        ..Default::default()
      },
    );
    profiles.insert(
      "finance".to_string(),
      DomainProfile {
        sync_on_mount: SyncOnMount::Never,
        ..Default::default()
      },
    );

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = DashboardStore::new(StoreConfig::in_memory(u64::MAX))
      .with_profiles(Arc::new(ProfileRegistry::new(DomainProfile::default(), profiles)))
      .with_clock(clock.clone());
    store.init().unwrap();
    let store = Arc::new(store);

    let events = EventBus::default();
    let queue = Arc::new(OfflineQueue::attach(&store, events.clone()).unwrap());

    let state = Arc::new(FakeState::default());
    state
      .data
      .lock()
      .unwrap()
      .insert("status".to_string(), json!({"v": 1}));

    let remote = Arc::new(FakeRemote {
      state: Arc::clone(&state),
      delay,
    });

    Harness {
      manager: SyncManager::new(store, queue, remote, events),
      state,
      clock,
    }
  }

  #[tokio::test]
  async fn test_concurrent_syncs_share_one_fetch() {
    let h = harness(Duration::from_millis(50));

    let (a, b) = tokio::join!(
      h.manager.sync_dashboard("medical", SyncOptions::default()),
      h.manager.sync_dashboard("medical", SyncOptions::default()),
    );

    assert_eq!(h.state.fetches.load(Ordering::SeqCst), 1);
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(a.entries, b.entries);
    assert_eq!(
      h.manager.store().get::<Value>("medical", "status").unwrap(),
      Some(json!({"v": 1}))
    );
    assert_eq!(h.manager.state("medical"), SyncState::Idle);
  }

  #[tokio::test]
  async fn test_forced_sync_joins_in_flight_sync() {
    let h = harness(Duration::from_millis(50));

    let (_a, _b) = tokio::join!(
      h.manager.sync_dashboard("grid", SyncOptions::default()),
      h.manager.sync_dashboard("grid", SyncOptions::forced()),
    );

    assert_eq!(h.state.fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fresh_domain_skips_fetch_unless_forced() {
    let h = harness(Duration::ZERO);
    h.manager
      .sync_dashboard("grid", SyncOptions::default())
      .await;

    let report = h
      .manager
      .sync_dashboard("grid", SyncOptions::default())
      .await;
    assert_eq!(report.source, CacheSource::CacheFresh);
    assert_eq!(h.state.fetches.load(Ordering::SeqCst), 1);

    h.manager.sync_dashboard("grid", SyncOptions::forced()).await;
    assert_eq!(h.state.fetches.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_failed_sync_keeps_cached_data_and_records_error() {
    let h = harness(Duration::ZERO);
    h.manager.sync_dashboard("grid", SyncOptions::forced()).await;

    h.state.fail_fetch.store(true, Ordering::SeqCst);
    let report = h.manager.sync_dashboard("grid", SyncOptions::forced()).await;

    assert!(matches!(report.error, Some(SyncError::NetworkSyncFailed(_))));
    assert_eq!(report.source, CacheSource::Offline);
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].data, json!({"v": 1}));
    assert!(h.manager.last_error("grid").is_some());

    h.state.fail_fetch.store(false, Ordering::SeqCst);
    h.manager.sync_dashboard("grid", SyncOptions::forced()).await;
    assert!(h.manager.last_error("grid").is_none());
  }

  #[tokio::test]
  async fn test_slow_fetch_times_out() {
    let h = harness(Duration::from_millis(500));
    let manager = h.manager.clone().with_timeout(Duration::from_millis(20));

    let report = manager.sync_dashboard("grid", SyncOptions::forced()).await;

    assert_eq!(
      report.error,
      Some(SyncError::Timeout(Duration::from_millis(20)))
    );
    assert_eq!(manager.state("grid"), SyncState::Idle);
  }

  #[tokio::test]
  async fn test_sync_completes_after_caller_gives_up() {
    let h = harness(Duration::from_millis(30));

    let abandoned = tokio::time::timeout(
      Duration::from_millis(5),
      h.manager.sync_dashboard("grid", SyncOptions::forced()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(h.manager.state("grid"), SyncState::Syncing);

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.manager.state("grid"), SyncState::Idle);
    assert_eq!(
      h.manager.store().get::<Value>("grid", "status").unwrap(),
      Some(json!({"v": 1}))
    );
  }

  #[tokio::test]
  async fn test_should_sync_on_mount_policies() {
    let h = harness(Duration::ZERO);

    assert!(h.manager.should_sync_on_mount("medical"));
    assert!(!h.manager.should_sync_on_mount("finance"));
    assert!(h.manager.should_sync_on_mount("grid"));

    h.manager.sync_dashboard("grid", SyncOptions::forced()).await;
    assert!(!h.manager.should_sync_on_mount("grid"));

    h.clock.advance(chrono::Duration::seconds(61));
    assert!(h.manager.should_sync_on_mount("grid"));
  }

  #[tokio::test]
  async fn test_load_serves_stale_cache_when_offline() {
    let h = harness(Duration::ZERO);
    h.manager.sync_dashboard("grid", SyncOptions::forced()).await;
    h.clock.advance(chrono::Duration::seconds(120));
    h.manager.set_connectivity(Connectivity::Offline);

    let result = h.manager.load("grid").await;

    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.len(), 1);
    assert_eq!(h.state.fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_load_refreshes_stale_cache_when_online() {
    let h = harness(Duration::ZERO);

    let first = h.manager.load("grid").await;
    assert_eq!(first.source, CacheSource::Network);

    let second = h.manager.load("grid").await;
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(h.state.fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_mutate_queues_when_offline() {
    let h = harness(Duration::ZERO);
    h.manager.set_connectivity(Connectivity::Offline);

    let outcome = h
      .manager
      .mutate("grid", Operation::new("POST", "grid/save", json!({"id": 1})))
      .await
      .unwrap();

    assert!(matches!(outcome, MutationOutcome::Queued(_)));
    assert_eq!(h.manager.queue().size().unwrap(), 1);
    assert!(h.state.replayed.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_mutate_applies_when_online() {
    let h = harness(Duration::ZERO);

    let outcome = h
      .manager
      .mutate("grid", Operation::new("POST", "grid/save", json!({"id": 1})))
      .await
      .unwrap();

    assert_eq!(outcome, MutationOutcome::Applied);
    assert_eq!(h.manager.queue().size().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_reconnect_drains_then_syncs_replayed_domains() {
    let h = harness(Duration::ZERO);
    let queue = h.manager.queue();
    queue
      .enqueue("grid", Operation::new("POST", "grid/1", json!({"id": 1})))
      .unwrap();
    queue
      .enqueue("medical", Operation::new("POST", "medical/2", json!({"id": 2})))
      .unwrap();
    queue
      .enqueue("grid", Operation::new("POST", "grid/3", json!({"id": 3})))
      .unwrap();
    *h.state.fail_replay_target.lock().unwrap() = Some("medical/2".to_string());

    let report = h.manager.on_reconnect().await;

    assert_eq!(
      *h.state.replayed.lock().unwrap(),
      vec!["grid/1".to_string(), "grid/3".to_string()]
    );
    assert_eq!(report.error, Some(SyncError::QueueReplayFailed { failed: 1 }));
    let synced: Vec<_> = report.synced.iter().map(|r| r.domain.as_str()).collect();
    assert_eq!(synced, vec!["grid"]);
    assert_eq!(queue.size().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_watch_connectivity_drains_on_transition() {
    let h = harness(Duration::ZERO);
    let mut events = h.manager.events().subscribe();
    h.manager
      .queue()
      .enqueue("grid", Operation::new("POST", "grid/1", json!({"id": 1})))
      .unwrap();

    let (tx, rx) = watch::channel(Connectivity::Offline);
    let handle = h.manager.watch_connectivity(rx);
    tx.send(Connectivity::Online).unwrap();

    let synced = tokio::time::timeout(Duration::from_secs(2), async {
      loop {
        if let Ok(SyncEvent::QueueSynced { domain, .. }) = events.recv().await {
          return domain;
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(synced, "grid");
    assert!(h.manager.is_online());
    drop(tx);
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_crashed_sync_is_unregistered() {
    let h = harness(Duration::ZERO);
    h.state.panic_fetch.store(true, Ordering::SeqCst);

    let report = h.manager.sync_dashboard("grid", SyncOptions::forced()).await;

    assert!(matches!(report.error, Some(SyncError::NetworkSyncFailed(_))));
    assert_eq!(h.manager.state("grid"), SyncState::Idle);

    h.state.panic_fetch.store(false, Ordering::SeqCst);
    let report = h.manager.sync_dashboard("grid", SyncOptions::forced()).await;
    assert!(report.is_ok());
    assert_eq!(h.state.fetches.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_finishing_old_sync_keeps_newer_registration() {
    let h = harness(Duration::from_millis(200));
    let inner = &h.manager.inner;

    let pending = h.manager.sync_dashboard("grid", SyncOptions::forced());
    tokio::pin!(pending);
    assert!(tokio::time::timeout(Duration::from_millis(5), &mut pending)
      .await
      .is_err());

    let current = lock(&inner.in_flight).get("grid").map(|f| f.id);
    let stale_id = current.unwrap().wrapping_sub(1);
    finish_in_flight(inner, "grid", stale_id);
    assert_eq!(h.manager.state("grid"), SyncState::Syncing);

    finish_in_flight(inner, "grid", current.unwrap());
    assert_eq!(h.manager.state("grid"), SyncState::Idle);
  }

  #[tokio::test]
  async fn test_watch_connectivity_publishes_initial_offline() {
    let h = harness(Duration::ZERO);
    let mut events = h.manager.events().subscribe();

    let (tx, rx) = watch::channel(Connectivity::Offline);
    let handle = h.manager.watch_connectivity(rx);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
      .await
      .unwrap()
      .unwrap();

    assert_eq!(event, SyncEvent::Offline);
    assert!(!h.manager.is_online());
    drop(tx);
    handle.await.unwrap();
  }
}
