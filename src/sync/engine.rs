//! Drain cycles: flushing the pending queue against the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, Partition};
use crate::net::{ApiClient, FailureKind, SubmitOutcome, SubmitReceipt};
use crate::queue::ActionQueue;

use super::status::{StatusPublisher, SyncStatus};

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
  /// Every eligible action was confirmed by the server.
  Completed,
  /// At least one action failed and is now backing off or dead-lettered.
  PartialFailure,
  /// Connectivity was missing or dropped mid-cycle; unfinished work was
  /// reverted to pending for the next cycle.
  Aborted,
  /// Another drain cycle was already active; nothing was attempted.
  Skipped,
}

/// Drains the pending action queue over the network.
///
/// The engine has no persistent state of its own: it operates on the
/// queue and reports into the status channel. Submission is sequential
/// to preserve the queue's FIFO intent ordering.
pub struct SyncEngine {
  queue: Arc<ActionQueue>,
  cache: Arc<dyn CacheStore>,
  client: ApiClient,
  status: StatusPublisher,
  batch_size: usize,
  /// Guards against overlapping cycles from concurrent sync triggers.
  draining: AtomicBool,
}

impl SyncEngine {
  pub fn new(
    queue: Arc<ActionQueue>,
    cache: Arc<dyn CacheStore>,
    client: ApiClient,
    status: StatusPublisher,
    batch_size: usize,
  ) -> Self {
    Self {
      queue,
      cache,
      client,
      status,
      batch_size,
      draining: AtomicBool::new(false),
    }
  }

  /// Recompute and publish the status snapshot from the queue's current
  /// contents. Returns the published snapshot.
  pub fn refresh_status(&self, is_online: bool) -> Result<SyncStatus> {
    let status = self.snapshot(is_online, false)?;
    self.status.publish(status.clone());
    Ok(status)
  }

  /// Run one drain cycle: take eligible actions in FIFO order and submit
  /// them one at a time until the queue has no eligible work left.
  ///
  /// A failure of one action never aborts the rest of the batch; only a
  /// connectivity loss does, and then every unresolved in-flight action
  /// is reverted to pending rather than lost. At most one cycle runs at
  /// a time; triggers arriving mid-cycle are skipped.
  pub async fn drain(&self) -> Result<CycleOutcome> {
    if self.draining.swap(true, Ordering::SeqCst) {
      debug!("drain already active, skipping");
      return Ok(CycleOutcome::Skipped);
    }

    let outcome = self.drain_cycle().await;
    self.draining.store(false, Ordering::SeqCst);
    outcome
  }

  async fn drain_cycle(&self) -> Result<CycleOutcome> {
    if !self.status.current().is_online {
      debug!("drain requested while offline, skipping");
      return Ok(CycleOutcome::Aborted);
    }

    self.status.publish(self.snapshot(true, true)?);

    let mut had_failure = false;
    let mut connection_lost = false;

    'cycle: loop {
      let batch = self.queue.peek_batch(self.batch_size)?;
      if batch.is_empty() {
        break;
      }
      debug!(size = batch.len(), "draining batch");

      for action in batch {
        self.queue.mark_in_flight(action.id)?;

        match self
          .client
          .submit_action(action.id, &action.kind, &action.payload)
          .await
        {
          SubmitOutcome::Applied(receipt) => {
            self.queue.mark_synced(action.id)?;
            debug!(id = %action.id, kind = %action.kind, "action synced");
            if let Some(receipt) = receipt {
              self.apply_receipt(&receipt);
            }
          }
          SubmitOutcome::Failed {
            kind: FailureKind::Permanent,
            error,
          } => {
            warn!(id = %action.id, kind = %action.kind, %error, "action rejected, dead-lettering");
            self.queue.mark_dead(action.id, &error)?;
            had_failure = true;
          }
          SubmitOutcome::Failed {
            kind: FailureKind::Transient,
            error,
          } => {
            warn!(id = %action.id, kind = %action.kind, %error, "action failed transiently");
            self.queue.mark_failed(action.id, &error)?;
            had_failure = true;

            // A transient failure may mean connectivity is gone
            // entirely. Check before touching the next item so an
            // outage aborts the cycle instead of burning every
            // action's retry budget.
            if !self.client.probe().await {
              info!("connectivity lost mid-cycle, aborting drain");
              connection_lost = true;
              break 'cycle;
            }
          }
        }
      }
    }

    if connection_lost {
      let reverted = self.queue.revert_in_flight()?;
      if reverted > 0 {
        debug!(reverted, "reverted unresolved in-flight actions");
      }
      self.status.publish(self.snapshot(false, false)?);
      return Ok(CycleOutcome::Aborted);
    }

    self.queue.set_last_sync_time(Utc::now())?;
    self.status.publish(self.snapshot(true, false)?);

    if had_failure {
      Ok(CycleOutcome::PartialFailure)
    } else {
      Ok(CycleOutcome::Completed)
    }
  }

  /// Fold a server-confirmed resource into the read cache so reads see
  /// the post-mutation state without another fetch. Best-effort: cache
  /// trouble never fails the drain.
  fn apply_receipt(&self, receipt: &SubmitReceipt) {
    let (Some(key), Some(resource)) = (&receipt.resource_key, &receipt.resource) else {
      return;
    };

    match serde_json::to_vec(resource) {
      Ok(payload) => {
        if let Err(e) = self.cache.put(Partition::Api, key, &payload) {
          warn!(key = %key, "failed to cache confirmed resource: {}", e);
        }
      }
      Err(e) => warn!(key = %key, "failed to serialize confirmed resource: {}", e),
    }
  }

  fn snapshot(&self, is_online: bool, is_syncing: bool) -> Result<SyncStatus> {
    let counts = self.queue.counts()?;
    Ok(SyncStatus {
      is_online,
      is_syncing,
      pending_count: counts.pending + counts.in_flight,
      failed_count: counts.dead,
      last_sync_time: self.queue.last_sync_time()?,
    })
  }
}
