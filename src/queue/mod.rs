//! Ordered, durable log of not-yet-synced mutations.

mod store;

pub use store::{ActionQueue, ActionStatus, PendingAction, QueueCounts, RetryPolicy};
