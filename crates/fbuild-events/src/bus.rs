//! Event bus for broadcasting daemon events to subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::event::DaemonEvent;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast bus carrying [`DaemonEvent`]s.
///
/// Publishing never blocks; each subscriber owns an independent cursor and
/// lags (dropping old events) if it falls behind.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<DaemonEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers the event reached.
    pub fn publish(&self, event: DaemonEvent) -> usize {
        let event = Arc::new(event);
        trace!(event = event.event_name(), "publishing event");
        match self.sender.send(Arc::clone(&event)) {
            Ok(count) => {
                debug!(event = event.event_name(), receivers = count, "event published");
                count
            },
            Err(_) => {
                // No receivers; nothing is listening yet.
                trace!(event = event.event_name(), "no receivers for event");
                0
            },
        }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<DaemonEvent>>,
}

impl EventReceiver {
    /// Receive the next event, skipping over any lag gaps.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<Arc<DaemonEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without waiting; `None` when nothing is pending.
    pub fn try_recv(&mut self) -> Option<Arc<DaemonEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "event receiver lagged, events dropped");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbuild_core::ClientId;

    fn sample_event() -> DaemonEvent {
        DaemonEvent::ClientConnected {
            client_id: ClientId::new("c1"),
        }
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.publish(sample_event()), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_name(), "client_connected");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(sample_event()), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.publish(sample_event()), 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert!(rx.try_recv().is_none());
        bus.publish(sample_event());
        assert!(rx.try_recv().is_some());
    }
}
