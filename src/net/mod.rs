//! Network boundary: request/response exchanges with the backend.

pub mod client;
pub mod types;

pub use client::{ApiClient, FailureKind, SubmitOutcome};
pub use types::{PushSubscription, SubmitReceipt, SubscriptionKeys};
