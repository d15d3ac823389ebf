//! Wire types exchanged with the backend REST API.

use serde::{Deserialize, Serialize};

/// Receipt returned by the backend after applying a queued action.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitReceipt {
  /// Idempotency id the server deduplicated on.
  pub id: String,
  /// Cache key of the resource this mutation touched, if the server
  /// reports one.
  #[serde(default)]
  pub resource_key: Option<String>,
  /// Server-confirmed resource state after applying the mutation.
  #[serde(default)]
  pub resource: Option<serde_json::Value>,
}

/// Body posted when registering or refreshing a push subscription.
#[derive(Debug, Clone, Serialize)]
pub struct PushSubscription {
  pub endpoint: String,
  pub keys: SubscriptionKeys,
  pub platform: String,
  pub device_name: String,
}

/// Opaque keying material for a push subscription. The private matching
/// secret never leaves the device; only these public halves are sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionKeys {
  pub p256dh: String,
  pub auth: String,
}
