//! Push notifications over a tokio broadcast channel.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{NotificationSink, TaskEvent};
use crate::error::FableResult;

/// Real-time notifier backed by a broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<TaskEvent>,
}

impl BroadcastNotifier {
    /// Create a notifier with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all subsequent events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotifier {
    async fn publish(&self, event: TaskEvent) -> FableResult<()> {
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped, no subscribers");
        }
        Ok(())
    }
}
