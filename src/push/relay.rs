//! Decoding, deduplication, and fan-out of inbound push messages.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::{debug, warn};
use uuid::Uuid;

/// Push payload as sent by the backend. Every field but `type` is
/// optional; anything missing is filled with generic content.
#[derive(Debug, Clone, Deserialize)]
struct PushEnvelope {
  #[serde(rename = "type")]
  kind: String,
  title: Option<String>,
  body: Option<String>,
  #[serde(default)]
  data: serde_json::Value,
  tag: Option<String>,
}

/// Categories the relay renders specially. Unknown payload types map to
/// `Generic` rather than being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
  /// An invoice was created, paid, or fell overdue.
  Invoice,
  /// A support ticket changed state or was assigned.
  Ticket,
  /// Inventory stock-level alert.
  Stock,
  /// Server hint that locally cached data is out of date.
  DataChanged,
  /// Anything the relay does not specifically understand.
  Generic,
}

impl NotificationKind {
  fn from_type(payload_type: &str) -> Self {
    match payload_type {
      "invoice_created" | "invoice_paid" | "invoice_overdue" => NotificationKind::Invoice,
      "ticket_update" | "ticket_assigned" => NotificationKind::Ticket,
      "stock_alert" => NotificationKind::Stock,
      "data_changed" => NotificationKind::DataChanged,
      _ => NotificationKind::Generic,
    }
  }
}

/// One entry in the relay's bounded history.
#[derive(Debug, Clone)]
pub struct Notification {
  pub id: Uuid,
  /// Dedup key: the payload's tag, or the relay-assigned id.
  pub tag: String,
  pub kind: NotificationKind,
  pub title: String,
  pub body: String,
  pub data: serde_json::Value,
  pub received_at: DateTime<Utc>,
  pub read: bool,
}

impl Notification {
  /// Build the mutation payload for one of this notification's action
  /// buttons (approve/reject on a ticket, for example). The caller
  /// enqueues it like any other mutation so it survives offline spells.
  pub fn action_payload(&self, action: &str) -> Vec<u8> {
    serde_json::json!({
      "action": action,
      "notification_tag": self.tag,
      "target": self.data,
    })
    .to_string()
    .into_bytes()
  }
}

/// What the dispatcher should do after a payload was relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEffect {
  /// A new notification was recorded.
  Notify,
  /// Recorded, and the server hinted our cached data is stale: kick a
  /// sync cycle.
  NotifyAndSync,
  /// Redelivery of an already-known tag; nothing recorded.
  Duplicate,
}

/// Collaborator that renders notifications at the platform level,
/// subject to a previously granted permission capability.
pub trait NotificationDisplay: Send + Sync {
  fn can_display(&self) -> bool;
  fn display(&self, notification: &Notification);
}

/// Decodes push payloads into a bounded, most-recent-first history.
pub struct NotificationRelay {
  history: VecDeque<Notification>,
  capacity: usize,
  display: Option<Box<dyn NotificationDisplay>>,
}

impl NotificationRelay {
  pub fn new(capacity: usize) -> Self {
    Self {
      history: VecDeque::new(),
      capacity,
      display: None,
    }
  }

  /// Attach a platform display collaborator.
  pub fn with_display(mut self, display: Box<dyn NotificationDisplay>) -> Self {
    self.display = Some(display);
    self
  }

  /// Ingest a raw push payload. Malformed JSON degrades to a generic
  /// notification; the event is never silently dropped.
  pub fn ingest(&mut self, raw: &[u8]) -> RelayEffect {
    let envelope = match serde_json::from_slice::<PushEnvelope>(raw) {
      Ok(envelope) => envelope,
      Err(e) => {
        warn!("malformed push payload, relaying as generic: {}", e);
        PushEnvelope {
          kind: String::new(),
          title: None,
          body: None,
          data: serde_json::Value::Null,
          tag: None,
        }
      }
    };

    let id = Uuid::new_v4();
    let tag = envelope.tag.unwrap_or_else(|| id.to_string());

    if self.history.iter().any(|n| n.tag == tag) {
      debug!(tag = %tag, "duplicate push delivery ignored");
      return RelayEffect::Duplicate;
    }

    let kind = NotificationKind::from_type(&envelope.kind);
    let notification = Notification {
      id,
      tag,
      kind,
      title: envelope.title.unwrap_or_else(|| "Notification".to_string()),
      body: envelope.body.unwrap_or_default(),
      data: envelope.data,
      received_at: Utc::now(),
      read: false,
    };

    if let Some(display) = &self.display {
      if display.can_display() {
        display.display(&notification);
      }
    }

    self.history.push_front(notification);
    self.history.truncate(self.capacity);

    if kind == NotificationKind::DataChanged {
      RelayEffect::NotifyAndSync
    } else {
      RelayEffect::Notify
    }
  }

  /// Most-recent-first history.
  pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
    self.history.iter()
  }

  pub fn get(&self, id: Uuid) -> Option<&Notification> {
    self.history.iter().find(|n| n.id == id)
  }

  pub fn unread_count(&self) -> usize {
    self.history.iter().filter(|n| !n.read).count()
  }

  /// Returns false when no notification has that id.
  pub fn mark_as_read(&mut self, id: Uuid) -> bool {
    match self.history.iter_mut().find(|n| n.id == id) {
      Some(notification) => {
        notification.read = true;
        true
      }
      None => false,
    }
  }

  pub fn mark_all_read(&mut self) {
    for notification in &mut self.history {
      notification.read = true;
    }
  }

  pub fn clear(&mut self) {
    self.history.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};

  struct RecordingDisplay {
    granted: bool,
    shown: Arc<Mutex<Vec<String>>>,
  }

  impl NotificationDisplay for RecordingDisplay {
    fn can_display(&self) -> bool {
      self.granted
    }

    fn display(&self, notification: &Notification) {
      self.shown.lock().unwrap().push(notification.title.clone());
    }
  }

  #[test]
  fn test_unknown_type_becomes_generic_notification() {
    let mut relay = NotificationRelay::new(10);
    let effect = relay.ingest(br#"{"type":"unknown_event"}"#);

    assert_eq!(effect, RelayEffect::Notify);
    let entries: Vec<_> = relay.notifications().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, NotificationKind::Generic);
    assert_eq!(entries[0].title, "Notification");
  }

  #[test]
  fn test_malformed_payload_is_not_dropped() {
    let mut relay = NotificationRelay::new(10);
    let effect = relay.ingest(b"not json at all");

    assert_eq!(effect, RelayEffect::Notify);
    assert_eq!(relay.notifications().count(), 1);
  }

  #[test]
  fn test_duplicate_tags_are_ignored() {
    let mut relay = NotificationRelay::new(10);
    relay.ingest(br#"{"type":"ticket_update","tag":"ticket-7"}"#);
    let effect = relay.ingest(br#"{"type":"ticket_update","tag":"ticket-7"}"#);

    assert_eq!(effect, RelayEffect::Duplicate);
    assert_eq!(relay.notifications().count(), 1);
  }

  #[test]
  fn test_history_is_bounded_most_recent_first() {
    let mut relay = NotificationRelay::new(3);
    for i in 0..5 {
      let payload = format!(r#"{{"type":"stock_alert","tag":"t{}","title":"n{}"}}"#, i, i);
      relay.ingest(payload.as_bytes());
    }

    let titles: Vec<_> = relay.notifications().map(|n| n.title.as_str()).collect();
    assert_eq!(titles, vec!["n4", "n3", "n2"]);
  }

  #[test]
  fn test_data_changed_requests_sync() {
    let mut relay = NotificationRelay::new(10);
    let effect = relay.ingest(br#"{"type":"data_changed","data":{"resource":"invoices"}}"#);
    assert_eq!(effect, RelayEffect::NotifyAndSync);
  }

  #[test]
  fn test_unread_tracking() {
    let mut relay = NotificationRelay::new(10);
    relay.ingest(br#"{"type":"invoice_paid","tag":"a"}"#);
    relay.ingest(br#"{"type":"invoice_paid","tag":"b"}"#);
    assert_eq!(relay.unread_count(), 2);

    let id = relay.notifications().next().unwrap().id;
    assert!(relay.mark_as_read(id));
    assert_eq!(relay.unread_count(), 1);

    relay.mark_all_read();
    assert_eq!(relay.unread_count(), 0);

    assert!(!relay.mark_as_read(Uuid::new_v4()));
  }

  #[test]
  fn test_display_respects_permission() {
    let shown = Arc::new(Mutex::new(Vec::new()));
    let mut relay = NotificationRelay::new(10).with_display(Box::new(RecordingDisplay {
      granted: false,
      shown: shown.clone(),
    }));
    relay.ingest(br#"{"type":"invoice_paid","title":"Paid"}"#);
    assert!(shown.lock().unwrap().is_empty());

    let mut relay = NotificationRelay::new(10).with_display(Box::new(RecordingDisplay {
      granted: true,
      shown: shown.clone(),
    }));
    relay.ingest(br#"{"type":"invoice_paid","title":"Paid"}"#);
    assert_eq!(*shown.lock().unwrap(), vec!["Paid".to_string()]);
  }

  #[test]
  fn test_action_payload_carries_target_data() {
    let mut relay = NotificationRelay::new(10);
    relay.ingest(br#"{"type":"ticket_update","tag":"ticket-9","data":{"ticket_id":9}}"#);

    let notification = relay.notifications().next().unwrap();
    let payload = notification.action_payload("approve");
    let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(value["action"], "approve");
    assert_eq!(value["target"]["ticket_id"], 9);
  }
}
