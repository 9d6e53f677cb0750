//! Durable FIFO of mutations made while offline.
//!
//! Items are only removed by a successful replay, [`OfflineQueue::purge`],
//! or [`OfflineQueue::clear`]. A failed replay leaves the item in place,
//! bumps its attempt counter, and the drain moves on to the next item.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::store::from_millis;
use crate::cache::DashboardStore;
use crate::clock::{Clock, SystemClock};
use crate::db::Database;
use crate::error::Result;
use crate::event::{EventBus, SyncEvent};

/// Opaque description of a write to send to the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
  /// HTTP-style method, e.g. "POST"
  pub method: String,
  /// Resource path relative to the remote base
  pub target: String,
  #[serde(default)]
  pub payload: Value,
}

impl Operation {
  pub fn new(method: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
    Self {
      method: method.into(),
      target: target.into(),
      payload,
    }
  }
}

/// A pending mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
  /// Increasing in enqueue order
  pub id: i64,
  pub domain: String,
  pub operation: Operation,
  pub enqueued_at: DateTime<Utc>,
  /// Failed replay attempts so far
  pub attempts: u32,
  pub last_error: Option<String>,
}

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
  /// Items replayed and removed, in replay order
  pub replayed: Vec<QueueItem>,
  /// Items that failed and remain queued
  pub failed: Vec<QueueItem>,
}

impl DrainReport {
  /// Domains touched by successfully replayed items.
  pub fn replayed_domains(&self) -> BTreeSet<String> {
    self.replayed.iter().map(|i| i.domain.clone()).collect()
  }

  pub fn failure_count(&self) -> usize {
    self.failed.len()
  }
}

pub struct OfflineQueue {
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
  events: EventBus,
  /// Only one drain walks the queue at a time
  drain_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
  pub fn new(db: Arc<Database>, events: EventBus) -> Self {
    Self {
      db,
      clock: Arc::new(SystemClock),
      events,
      drain_lock: tokio::sync::Mutex::new(()),
    }
  }

  /// Queue backed by the same database and clock as `store`.
  pub fn attach(store: &DashboardStore, events: EventBus) -> Result<Self> {
    Ok(Self::new(store.database()?, events).with_clock(Arc::clone(store.clock())))
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Append `operation` and return its id. The item is on disk when this returns.
  pub fn enqueue(&self, domain: &str, operation: Operation) -> Result<i64> {
    let encoded = serde_json::to_string(&operation)?;
    let now = self.clock.now().timestamp_millis();

    let id = self.db.with_conn(|conn| {
      conn.execute(
        "INSERT INTO offline_queue (domain, operation, enqueued_at, attempts)
         VALUES (?, ?, ?, 0)",
        params![domain, encoded, now],
      )?;
      Ok(conn.last_insert_rowid())
    })?;

    debug!(id, domain, method = %operation.method, "Queued offline mutation");
    Ok(id)
  }

  pub fn size(&self) -> Result<usize> {
    let count: i64 = self.db.with_conn(|conn| {
      Ok(conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))?)
    })?;
    Ok(count.max(0) as usize)
  }

  /// Pending items in replay order.
  pub fn list(&self) -> Result<Vec<QueueItem>> {
    let rows: Vec<(i64, String, String, i64, u32, Option<String>)> =
      self.db.with_conn(|conn| {
        let mut stmt = conn.prepare(
          "SELECT id, domain, operation, enqueued_at, attempts, last_error
           FROM offline_queue ORDER BY id ASC",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok((
              row.get(0)?,
              row.get(1)?,
              row.get(2)?,
              row.get(3)?,
              row.get(4)?,
              row.get(5)?,
            ))
          })?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
      })?;

    rows
      .into_iter()
      .map(|(id, domain, operation, enqueued_at, attempts, last_error)| -> Result<QueueItem> {
        Ok(QueueItem {
          id,
          domain,
          operation: serde_json::from_str(&operation)?,
          enqueued_at: from_millis(enqueued_at),
          attempts,
          last_error,
        })
      })
      .collect()
  }

  /// Drop a single item by id. Returns whether it existed.
  pub fn purge(&self, id: i64) -> Result<bool> {
    let removed = self.db.with_conn(|conn| {
      Ok(conn.execute("DELETE FROM offline_queue WHERE id = ?", params![id])?)
    })?;
    if removed > 0 {
      info!(id, "Purged offline mutation");
    }
    Ok(removed > 0)
  }

  /// Discard every pending mutation.
  pub fn clear(&self) -> Result<usize> {
    let removed = self
      .db
      .with_conn(|conn| Ok(conn.execute("DELETE FROM offline_queue", [])?))?;
    if removed > 0 {
      warn!(removed, "Discarded offline mutations");
    }
    Ok(removed)
  }

  /// Replay every pending item in FIFO order.
  ///
  /// Successful items are removed and announced with
  /// [`SyncEvent::QueueSynced`]. Failed items stay where they are with
  /// `attempts` incremented, and the drain continues with the next item.
  /// Items enqueued while a drain is running wait for the next drain.
  pub async fn drain<F, Fut, E>(&self, mut replay: F) -> Result<DrainReport>
  where
    F: FnMut(QueueItem) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: Display,
  {
    let _guard = self.drain_lock.lock().await;
    let mut report = DrainReport::default();

    for item in self.list()? {
      match replay(item.clone()).await {
        Ok(()) => {
          self.db.with_conn(|conn| {
            conn.execute("DELETE FROM offline_queue WHERE id = ?", params![item.id])?;
            Ok(())
          })?;
          self.events.publish(SyncEvent::QueueSynced {
            id: item.id,
            domain: item.domain.clone(),
          });
          report.replayed.push(item);
        }
        Err(e) => {
          let error = e.to_string();
          let attempts = item.attempts.saturating_add(1);
          self.db.with_conn(|conn| {
            conn.execute(
              "UPDATE offline_queue SET attempts = ?, last_error = ? WHERE id = ?",
              params![attempts, error, item.id],
            )?;
            Ok(())
          })?;
          warn!(id = item.id, domain = %item.domain, attempts, error = %error, "Offline mutation replay failed");
          self.events.publish(SyncEvent::QueueReplayFailed {
            id: item.id,
            domain: item.domain.clone(),
            attempts,
            error: error.clone(),
          });
          report.failed.push(QueueItem {
            attempts,
            last_error: Some(error),
            ..item
          });
        }
      }
    }

    if !report.replayed.is_empty() || !report.failed.is_empty() {
      info!(
        replayed = report.replayed.len(),
        failed = report.failed.len(),
        "Drained offline queue"
      );
    }

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Mutex;
  use tempfile::TempDir;

  fn create_test_queue() -> (OfflineQueue, EventBus) {
    let events = EventBus::default();
    let db = Arc::new(Database::open_in_memory().expect("Open should succeed"));
    (OfflineQueue::new(db, events.clone()), events)
  }

  fn save(id: i64) -> Operation {
    Operation::new("POST", "grid/save", json!({"op": "save", "id": id}))
  }

  #[test]
  fn test_enqueue_returns_increasing_ids() {
    let (queue, _events) = create_test_queue();
    let a = queue.enqueue("grid", save(1)).unwrap();
    let b = queue.enqueue("medical", save(2)).unwrap();
    assert!(b > a);
    assert_eq!(queue.size().unwrap(), 2);
  }

  #[tokio::test]
  async fn test_drain_replays_in_fifo_order_and_empties_queue() {
    let (queue, events) = create_test_queue();
    let mut rx = events.subscribe();
    queue.enqueue("grid", save(1)).unwrap();
    queue.enqueue("medical", save(2)).unwrap();

    let seen = Mutex::new(Vec::new());
    let report = queue
      .drain(|item| {
        seen.lock().unwrap().push(item.operation.payload["id"].clone());
        async { Ok::<(), String>(()) }
      })
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
    assert_eq!(report.replayed.len(), 2);
    assert_eq!(queue.size().unwrap(), 0);
    assert!(matches!(rx.recv().await.unwrap(), SyncEvent::QueueSynced { .. }));
    assert!(matches!(rx.recv().await.unwrap(), SyncEvent::QueueSynced { .. }));
  }

  #[tokio::test]
  async fn test_failed_item_stays_queued_and_drain_continues() {
    let (queue, _events) = create_test_queue();
    let first = queue.enqueue("grid", save(1)).unwrap();
    queue.enqueue("grid", save(2)).unwrap();

    let report = queue
      .drain(|item| async move {
        if item.operation.payload["id"] == json!(1) {
          Err("server said no")
        } else {
          Ok(())
        }
      })
      .await
      .unwrap();

    assert_eq!(report.failure_count(), 1);
    assert_eq!(report.replayed.len(), 1);

    let remaining = queue.list().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, first);
    assert_eq!(remaining[0].attempts, 1);
    assert_eq!(remaining[0].last_error.as_deref(), Some("server said no"));
  }

  #[tokio::test]
  async fn test_retry_keeps_queue_position() {
    let (queue, _events) = create_test_queue();
    queue.enqueue("grid", save(1)).unwrap();
    queue
      .drain(|_| async { Err::<(), _>("offline") })
      .await
      .unwrap();
    queue.enqueue("grid", save(2)).unwrap();

    let order: Vec<_> = queue
      .list()
      .unwrap()
      .into_iter()
      .map(|i| i.operation.payload["id"].clone())
      .collect();
    assert_eq!(order, vec![json!(1), json!(2)]);
  }

  #[test]
  fn test_purge_and_clear() {
    let (queue, _events) = create_test_queue();
    let id = queue.enqueue("grid", save(1)).unwrap();
    queue.enqueue("grid", save(2)).unwrap();

    assert!(queue.purge(id).unwrap());
    assert!(!queue.purge(id).unwrap());
    assert_eq!(queue.clear().unwrap(), 1);
    assert_eq!(queue.size().unwrap(), 0);
  }

  #[test]
  fn test_queue_survives_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("cache.db");

    {
      let db = Arc::new(Database::open(&path).unwrap());
      let queue = OfflineQueue::new(db, EventBus::default());
      queue.enqueue("grid", save(1)).unwrap();
    }

    let db = Arc::new(Database::open(&path).unwrap());
    let queue = OfflineQueue::new(db, EventBus::default());
    let items = queue.list().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].operation, save(1));
  }
}
