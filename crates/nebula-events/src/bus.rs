//! Event bus for broadcasting plugin events to subscribers.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::EventResult;
use crate::event::{EventSink, PluginEvent};

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast bus for plugin events.
///
/// Clones share the same channel. Publishing never blocks: slow receivers
/// lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<PluginEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: PluginEvent) -> usize {
        let event = Arc::new(event);
        trace!(event = %event.name, "Publishing event");

        if let Ok(count) = self.sender.send(Arc::clone(&event)) {
            debug!(event = %event.name, plugin = %event.plugin, receiver_count = count, "Event published");
            count
        } else {
            trace!(event = %event.name, "No receivers for event");
            0
        }
    }

    /// Subscribe to every event.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), None)
    }

    /// Subscribe to events whose name matches a pattern.
    ///
    /// The pattern is an exact name (`plugin.sample_sync.sync.started`) or a
    /// trailing wildcard (`plugin.sample_sync.*`).
    #[must_use]
    pub fn subscribe_topic(&self, pattern: impl Into<String>) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), Some(pattern.into()))
    }

    /// Current number of receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the channel capacity.
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

impl EventSink for EventBus {
    fn emit(&self, event: PluginEvent) -> EventResult<usize> {
        Ok(self.publish(event))
    }
}

/// Receiver for events from the event bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<PluginEvent>>,
    pattern: Option<String>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<Arc<PluginEvent>>, pattern: Option<String>) -> Self {
        Self { receiver, pattern }
    }

    fn matches(&self, event: &PluginEvent) -> bool {
        let Some(pattern) = &self.pattern else {
            return true;
        };
        if let Some(prefix) = pattern.strip_suffix('*') {
            event.name.starts_with(prefix)
        } else {
            event.name == *pattern
        }
    }

    /// Receive the next matching event.
    ///
    /// Returns `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Arc<PluginEvent>> {
        let mut skipped: usize = 0;
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                    skipped = skipped.wrapping_add(1);
                    if skipped.is_multiple_of(100) {
                        tokio::task::yield_now().await;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive the next matching event without blocking.
    pub fn try_recv(&mut self) -> Option<Arc<PluginEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                },
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
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
    use nebula_core::PluginName;
    use serde_json::json;

    fn event(plugin: &str, name: &str) -> PluginEvent {
        PluginEvent::new(&PluginName::new(plugin).unwrap(), name, json!({}))
    }

    #[tokio::test]
    async fn test_event_bus_creation() {
        let bus = EventBus::new();
        assert_eq!(bus.capacity(), DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        assert_eq!(bus.publish(event("sample_sync", "sync.started")), 1);

        let msg = receiver.recv().await.unwrap();
        assert_eq!(msg.name, "plugin.sample_sync.sync.started");
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(event("sample_sync", "x")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cloned_bus_shares_channel() {
        let bus = EventBus::new();
        let cloned = bus.clone();
        let mut receiver = cloned.subscribe();

        bus.publish(event("alpha", "ping"));
        assert!(receiver.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_topic_subscription_exact() {
        let bus = EventBus::new();
        let mut specific = bus.subscribe_topic("plugin.alpha.ping");

        bus.publish(event("alpha", "ping"));
        bus.publish(event("alpha", "pong"));

        assert_eq!(specific.try_recv().unwrap().name, "plugin.alpha.ping");
        assert!(specific.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_topic_subscription_wildcard() {
        let bus = EventBus::new();
        let mut alpha_only = bus.subscribe_topic("plugin.alpha.*");

        bus.publish(event("beta", "ping"));
        bus.publish(event("alpha", "ping"));

        let received = alpha_only.try_recv().unwrap();
        assert_eq!(received.plugin.as_str(), "alpha");
        assert!(alpha_only.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_closed() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        drop(bus);
        assert!(receiver.recv().await.is_none());
    }
}
