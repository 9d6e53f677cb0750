use tokio::sync::broadcast;

use crate::error::SyncError;

/// Notifications published by the queue and the sync manager
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// A queued mutation was replayed and removed from the queue
  QueueSynced { id: i64, domain: String },
  /// A queued mutation failed to replay and stays queued
  QueueReplayFailed {
    id: i64,
    domain: String,
    attempts: u32,
    error: String,
  },
  /// A sync started for a domain
  SyncStarted { domain: String },
  /// Fresh data for a domain was committed to the cache
  SyncCompleted { domain: String, entries: usize },
  /// A sync failed; cached data is left untouched
  SyncFailed { domain: String, error: SyncError },
  /// Connectivity came back
  Online,
  /// Connectivity was lost
  Offline,
}

/// Publish/subscribe channel for [`SyncEvent`]s.
///
/// Publishing with no subscribers is fine; slow subscribers lose the oldest
/// events once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  pub fn publish(&self, event: SyncEvent) {
    // No receivers is not an error
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_receive_published_events() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();

    bus.publish(SyncEvent::Online);

    assert_eq!(rx.recv().await.unwrap(), SyncEvent::Online);
  }

  #[test]
  fn test_publish_without_subscribers_is_silent() {
    let bus = EventBus::new(0);
    bus.publish(SyncEvent::Offline);
  }
}
