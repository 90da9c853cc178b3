//! Engine event fan-out.
//!
//! The engine publishes an [`EngineEvent`] at every step boundary, suspension,
//! release, delegation change and failure. Observers (the CLI, tests, a
//! future dashboard) subscribe and read at their own pace; the engine never
//! waits on them. A subscriber that falls more than `event_capacity` events
//! behind receives `RecvError::Lagged` and skips ahead.

use switchyard_types::config::EngineConfig;
use switchyard_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Broadcast channel carrying engine events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Bus sized by `EngineConfig::event_capacity`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.event_capacity)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Send `event` to current subscribers; returns how many received it.
    /// With no subscribers the event is dropped and 0 is returned.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
