//! Derived sync status published to UI collaborators.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Snapshot of the engine's externally visible state.
///
/// Counts are always recomputed from the queue's durable contents, never
/// mutated incrementally, so what the UI displays cannot drift from what
/// the log actually holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
  pub is_online: bool,
  /// True only while a drain cycle is active.
  pub is_syncing: bool,
  /// Actions recorded but not yet confirmed by the server.
  pub pending_count: u64,
  /// Dead-lettered actions awaiting explicit resolution.
  pub failed_count: u64,
  pub last_sync_time: Option<DateTime<Utc>>,
}

/// Publisher half of the status channel. Owned by the sync engine; any
/// number of subscribers can watch for transitions.
pub struct StatusPublisher {
  tx: watch::Sender<SyncStatus>,
}

impl StatusPublisher {
  pub fn new() -> (Self, watch::Receiver<SyncStatus>) {
    let (tx, rx) = watch::channel(SyncStatus::default());
    (Self { tx }, rx)
  }

  /// Publish a new snapshot. Subscribers are only woken on change.
  pub fn publish(&self, status: SyncStatus) {
    self.tx.send_if_modified(|current| {
      if *current == status {
        false
      } else {
        *current = status;
        true
      }
    });
  }

  pub fn current(&self) -> SyncStatus {
    self.tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_publish_updates_subscribers() {
    let (publisher, rx) = StatusPublisher::new();
    assert!(!rx.borrow().is_online);

    publisher.publish(SyncStatus {
      is_online: true,
      pending_count: 3,
      ..SyncStatus::default()
    });

    let seen = rx.borrow();
    assert!(seen.is_online);
    assert_eq!(seen.pending_count, 3);
  }

  #[tokio::test]
  async fn test_unchanged_snapshot_does_not_wake_subscribers() {
    let (publisher, mut rx) = StatusPublisher::new();
    rx.mark_unchanged();

    publisher.publish(SyncStatus::default());
    assert!(!rx.has_changed().unwrap());
  }
}
