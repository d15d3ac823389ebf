//! Inbound push handling: decode, dedup, and relay to collaborators.

mod relay;

pub use relay::{Notification, NotificationDisplay, NotificationKind, NotificationRelay, RelayEffect};
