//! Dispatcher events driving the engine.

use std::time::Duration;
use tokio::sync::mpsc;

/// Why a sync cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Explicit user action.
  Manual,
  /// Connectivity returned after an offline period.
  Reconnect,
  /// Periodic background timer.
  Timer,
  /// A push message hinted that server data changed.
  PushHint,
}

/// Engine events
#[derive(Debug)]
pub enum Event {
  /// Periodic tick for connectivity probing and timer-based drains
  Tick,
  /// Raw push payload delivered by the platform push transport
  Push(Vec<u8>),
  /// A sync cycle was requested
  Sync(SyncTrigger),
  /// Stop the dispatcher loop
  Shutdown,
}

/// Event handler that merges a periodic tick with externally injected
/// events (push deliveries, UI requests) into one ordered stream.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn the tick timer
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for injecting events from other tasks
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
