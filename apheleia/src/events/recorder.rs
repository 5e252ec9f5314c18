//! Event recorder trait and implementations.

use async_trait::async_trait;
use tracing::{debug, info, Level};

use super::ReconcileEvent;

/// Receives the events the reconcilers emit on every transition.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Records an event.
    async fn record(&self, event: ReconcileEvent);

    /// Records an event without awaiting. Never fails.
    fn try_record(&self, event: ReconcileEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventRecorder;

#[async_trait]
impl EventRecorder for NoOpEventRecorder {
    async fn record(&self, _event: ReconcileEvent) {}

    fn try_record(&self, _event: ReconcileEvent) {}
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventRecorder {
    level: Level,
}

impl Default for LoggingEventRecorder {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventRecorder {
    /// Creates a recorder logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level recorder.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &ReconcileEvent) {
        let event_type = event.event_type();
        let key = event.key();
        if self.level == Level::DEBUG {
            debug!(event_type, key = %key, event = ?event, "{}", event.describe());
        } else {
            info!(event_type, key = %key, "{}", event.describe());
        }
    }
}

#[async_trait]
impl EventRecorder for LoggingEventRecorder {
    async fn record(&self, event: ReconcileEvent) {
        self.log_event(&event);
    }

    fn try_record(&self, event: ReconcileEvent) {
        self.log_event(&event);
    }
}

/// Keeps every event in memory, for assertions.
#[derive(Debug, Default)]
pub struct CollectingEventRecorder {
    events: parking_lot::RwLock<Vec<ReconcileEvent>>,
}

impl CollectingEventRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded event, in order.
    #[must_use]
    pub fn events(&self) -> Vec<ReconcileEvent> {
        self.events.read().clone()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Forgets every recorded event.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose type equals `event_type`.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<ReconcileEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventRecorder for CollectingEventRecorder {
    async fn record(&self, event: ReconcileEvent) {
        self.events.write().push(event);
    }

    fn try_record(&self, event: ReconcileEvent) {
        self.events.write().push(event);
    }
}
