//! Engine assembly and dispatcher loop.
//!
//! `App` owns one explicit instance of every component, wired together
//! at process start and passed by reference; there are no module-level
//! singletons. Its public methods are the entire surface surrounding
//! collaborators (UI code, push transports) are allowed to depend on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{
  self, cache_key, CacheStore, MutationOutcome, Partition, SqliteStore, StrategyOutcome,
};
use crate::config::Config;
use crate::event::{Event, EventHandler, SyncTrigger};
use crate::net::{ApiClient, PushSubscription, SubscriptionKeys};
use crate::push::{Notification, NotificationRelay, RelayEffect};
use crate::queue::{ActionQueue, PendingAction, RetryPolicy};
use crate::sync::{CycleOutcome, StatusPublisher, SyncEngine, SyncStatus};

pub struct App {
  config: Config,
  cache: Arc<dyn CacheStore>,
  queue: Arc<ActionQueue>,
  client: ApiClient,
  engine: Arc<SyncEngine>,
  relay: NotificationRelay,

  /// Read side of the engine's status channel
  status_rx: watch::Receiver<SyncStatus>,

  events: EventHandler,
  event_tx: mpsc::UnboundedSender<Event>,

  /// When the last drain cycle was kicked off
  last_drain: Instant,

  should_quit: bool,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let client = ApiClient::new(&config)?;
    let cache: Arc<dyn CacheStore> = Arc::new(SqliteStore::open()?);
    let queue = Arc::new(ActionQueue::open(RetryPolicy {
      max_retries: config.sync.max_retries,
      base_delay_secs: config.sync.retry_base_secs,
      max_delay_secs: config.sync.retry_cap_secs,
    })?);

    // Crash recovery: anything a previous process left in flight goes
    // back to pending before the first drain.
    let reverted = queue.revert_in_flight()?;
    if reverted > 0 {
      info!(reverted, "recovered interrupted in-flight actions");
    }

    let (publisher, status_rx) = StatusPublisher::new();
    let engine = Arc::new(SyncEngine::new(
      queue.clone(),
      cache.clone(),
      client.clone(),
      publisher,
      config.sync.batch_size,
    ));
    // Counts become visible before the first connectivity probe.
    engine.refresh_status(false)?;

    let relay = NotificationRelay::new(config.notifications.history_size);
    let events = EventHandler::new(Duration::from_secs(config.sync.tick_interval_secs));
    let event_tx = events.sender();

    Ok(Self {
      config,
      cache,
      queue,
      client,
      engine,
      relay,
      status_rx,
      events,
      event_tx,
      last_drain: Instant::now(),
      should_quit: false,
    })
  }

  /// Run the dispatcher until shutdown.
  pub async fn run(&mut self) -> Result<()> {
    while !self.should_quit {
      match self.events.next().await {
        Some(event) => self.handle_event(event).await?,
        None => break,
      }
    }
    Ok(())
  }

  async fn handle_event(&mut self, event: Event) -> Result<()> {
    match event {
      Event::Tick => self.handle_tick().await?,
      Event::Push(raw) => self.handle_push(&raw),
      Event::Sync(trigger) => self.handle_sync(trigger),
      Event::Shutdown => self.should_quit = true,
    }
    Ok(())
  }

  async fn handle_tick(&mut self) -> Result<()> {
    let was_online = self.status().is_online;
    let is_online = self.client.probe().await;

    if is_online != was_online {
      self.engine.refresh_status(is_online)?;
    }

    if is_online && !was_online {
      info!("connectivity restored");
      let _ = self.event_tx.send(Event::Sync(SyncTrigger::Reconnect));
    } else if is_online && self.drain_due() {
      let _ = self.event_tx.send(Event::Sync(SyncTrigger::Timer));
      self.sweep_caches();
    }

    Ok(())
  }

  /// Drain cycles run as spawned tasks so a slow cycle never blocks the
  /// dispatcher from handling ticks and push deliveries. The engine
  /// itself refuses to overlap cycles.
  fn handle_sync(&mut self, trigger: SyncTrigger) {
    debug!(?trigger, "drain requested");
    self.last_drain = Instant::now();

    let engine = self.engine.clone();
    tokio::spawn(async move {
      match engine.drain().await {
        Ok(outcome) => debug!(?outcome, "drain finished"),
        Err(e) => warn!("drain cycle failed: {}", e),
      }
    });
  }

  fn handle_push(&mut self, raw: &[u8]) {
    if self.relay.ingest(raw) == RelayEffect::NotifyAndSync {
      let _ = self.event_tx.send(Event::Sync(SyncTrigger::PushHint));
    }
  }

  fn drain_due(&self) -> bool {
    self.last_drain.elapsed() >= Duration::from_secs(self.config.sync.drain_interval_secs)
  }

  /// Enforce every partition's eviction policy. Failures are logged;
  /// sweeping is maintenance, not correctness.
  fn sweep_caches(&self) {
    for partition in Partition::ALL {
      let policy = self.config.cache.for_partition(partition);
      if let Err(e) = self.cache.sweep(partition, &policy) {
        warn!(partition = partition.as_str(), "cache sweep failed: {}", e);
      }
    }
  }

  // ----- Reads ---------------------------------------------------------

  /// Read an API resource: network-first, cached fallback when offline.
  pub async fn get_api(&self, path: &str) -> StrategyOutcome {
    let key = cache_key(path);
    let client = self.client.clone();
    let path = path.to_string();
    cache::strategy::network_first(self.cache.as_ref(), Partition::Api, &key, move || async move {
      client.fetch(&path).await
    })
    .await
  }

  /// Read a static asset: any cached copy is good enough.
  pub async fn get_asset(&self, path: &str) -> StrategyOutcome {
    let key = cache_key(path);
    let client = self.client.clone();
    let path = path.to_string();
    cache::strategy::cache_first(self.cache.as_ref(), Partition::Static, &key, move || async move {
      client.fetch(&path).await
    })
    .await
  }

  /// Default read for uncategorized resources: serve the cached copy
  /// immediately and refresh it in the background.
  pub async fn get_resource(&self, path: &str) -> StrategyOutcome {
    let key = cache_key(path);
    let client = self.client.clone();
    let path = path.to_string();
    cache::strategy::stale_while_revalidate(
      self.cache.clone(),
      Partition::Dynamic,
      &key,
      move || async move { client.fetch(&path).await },
    )
    .await
  }

  // ----- Mutations -----------------------------------------------------

  /// Attempt a mutation immediately; if it cannot reach the server it
  /// lands in the pending queue instead of failing.
  pub async fn submit_mutation(&self, kind: &str, payload: &[u8]) -> Result<MutationOutcome> {
    let client = self.client.clone();
    let kind_owned = kind.to_string();
    let payload_owned = payload.to_vec();

    let outcome = cache::strategy::network_only_with_queue(
      &self.queue,
      kind,
      payload,
      move |id| async move { client.submit(id, &kind_owned, &payload_owned).await },
    )
    .await?;

    self.engine.refresh_status(self.status().is_online)?;
    Ok(outcome)
  }

  /// Record a mutation without attempting the network, e.g. while the
  /// UI already knows the device is offline. Durable before return.
  pub fn enqueue_action(&self, kind: &str, payload: &[u8]) -> Result<Uuid> {
    let id = self.queue.enqueue(kind, payload)?;
    let status = self.engine.refresh_status(self.status().is_online)?;
    if status.is_online {
      let _ = self.event_tx.send(Event::Sync(SyncTrigger::Manual));
    }
    Ok(id)
  }

  // ----- Sync control ---------------------------------------------------

  /// Request a drain cycle from the dispatcher.
  pub fn force_sync(&self) {
    let _ = self.event_tx.send(Event::Sync(SyncTrigger::Manual));
  }

  /// Probe connectivity and run one drain cycle inline. Used by the
  /// one-shot agent mode and by tests.
  pub async fn sync_now(&mut self) -> Result<CycleOutcome> {
    let is_online = self.client.probe().await;
    self.engine.refresh_status(is_online)?;
    self.last_drain = Instant::now();
    self.engine.drain().await
  }

  /// Drop every queued action, dead letters included.
  pub fn clear_queue(&self) -> Result<()> {
    self.queue.clear()?;
    self.engine.refresh_status(self.status().is_online)?;
    Ok(())
  }

  // ----- Status ---------------------------------------------------------

  pub fn status(&self) -> SyncStatus {
    self.status_rx.borrow().clone()
  }

  /// Watch for status transitions (connectivity, counts, sync activity).
  pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
    self.status_rx.clone()
  }

  pub fn is_online(&self) -> bool {
    self.status().is_online
  }

  pub fn is_syncing(&self) -> bool {
    self.status().is_syncing
  }

  pub fn pending_count(&self) -> u64 {
    self.status().pending_count
  }

  pub fn last_sync_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
    self.status().last_sync_time
  }

  // ----- Dead letters ---------------------------------------------------

  /// Actions that exhausted their retries or were rejected outright.
  /// These wait for an explicit decision; they are never retried
  /// automatically.
  pub fn dead_letters(&self) -> Result<Vec<PendingAction>> {
    self.queue.dead_letters()
  }

  /// Put a dead-lettered action back in the queue with a fresh retry
  /// budget.
  pub fn retry_dead_letter(&self, id: Uuid) -> Result<()> {
    self.queue.retry_dead(id)?;
    self.engine.refresh_status(self.status().is_online)?;
    Ok(())
  }

  /// Drop a dead-lettered action for good.
  pub fn discard_dead_letter(&self, id: Uuid) -> Result<()> {
    self.queue.discard_dead(id)?;
    self.engine.refresh_status(self.status().is_online)?;
    Ok(())
  }

  // ----- Notifications --------------------------------------------------

  /// Sender for the platform push transport to deliver raw payloads
  /// into the dispatcher.
  pub fn event_sender(&self) -> mpsc::UnboundedSender<Event> {
    self.event_tx.clone()
  }

  pub fn notifications(&self) -> Vec<&Notification> {
    self.relay.notifications().collect()
  }

  pub fn unread_count(&self) -> usize {
    self.relay.unread_count()
  }

  pub fn mark_as_read(&mut self, id: Uuid) -> bool {
    self.relay.mark_as_read(id)
  }

  pub fn mark_all_read(&mut self) {
    self.relay.mark_all_read();
  }

  pub fn clear_notifications(&mut self) {
    self.relay.clear();
  }

  /// Handle a notification action button (approve/reject). The action
  /// goes through the pending queue like any other mutation, so it is
  /// retried rather than silently lost if the device is offline; the
  /// immediate drain request keeps the latency low when it is not.
  pub fn notification_action(&mut self, id: Uuid, action: &str) -> Result<Uuid> {
    let notification = self
      .relay
      .get(id)
      .ok_or_else(|| color_eyre::eyre::eyre!("No notification with id {}", id))?;

    let payload = notification.action_payload(action);
    let action_id = self.queue.enqueue("notification_action", &payload)?;
    self.relay.mark_as_read(id);
    self.engine.refresh_status(self.status().is_online)?;
    let _ = self.event_tx.send(Event::Sync(SyncTrigger::Manual));
    Ok(action_id)
  }

  /// Register this device's push subscription with the backend.
  pub async fn register_push_subscription(
    &self,
    endpoint: String,
    keys: SubscriptionKeys,
  ) -> Result<()> {
    let subscription = PushSubscription {
      endpoint,
      keys,
      platform: self.config.device.platform.clone(),
      device_name: self.config.device.name.clone(),
    };
    self.client.register_push_subscription(&subscription).await
  }

  // ----- Cache management -----------------------------------------------

  /// Cut a partition over to a new generation. Old entries become
  /// unreachable at once and are garbage-collected in the background.
  pub fn rotate_cache(&self, partition: Partition, generation: &str) -> Result<()> {
    self.cache.rotate(partition, generation)?;

    let cache = self.cache.clone();
    tokio::spawn(async move {
      match cache.collect_garbage() {
        Ok(removed) if removed > 0 => debug!(removed, "collected rotated cache entries"),
        Ok(_) => {}
        Err(e) => warn!("cache garbage collection failed: {}", e),
      }
    });

    Ok(())
  }

  /// Drop a single cached entry, forcing the next read to the network.
  pub fn invalidate_cached(&self, partition: Partition, path: &str) -> Result<()> {
    self.cache.delete(partition, &cache_key(path))
  }
}
