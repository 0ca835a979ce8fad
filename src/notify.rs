//! Fan-out notification hub.
//!
//! Every decision, enrollment outcome, and status update is published once
//! here and fans out to all current subscribers (gateway connections, tests).
//! Publishing never blocks and never fails: a hub with no subscribers simply
//! drops the notification.

use tokio::sync::broadcast;
use tracing::trace;

use crate::types::Notification;

/// Subscriber channel capacity. Slow subscribers that fall further behind
/// than this lose oldest-first (broadcast lag semantics).
const HUB_CAPACITY: usize = 256;

/// Cloneable handle for publishing and subscribing to notifications.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
    /// Create a hub with no subscribers yet.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// Publish a notification to every current subscriber.
    pub fn publish(&self, notification: Notification) {
        trace!(?notification, "publishing notification");
        // An Err here only means nobody is subscribed right now.
        let _ = self.tx.send(notification);
    }

    /// Open a new subscription receiving every notification from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Number of live subscribers (used by health reporting and tests).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}
