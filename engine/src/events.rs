//! Engine events for UI collaborators.
//!
//! Events go out over a bounded `broadcast` channel. The engine never waits on
//! subscribers; a subscriber that falls behind sees `RecvError::Lagged` and
//! skips ahead.

use crate::{coordinator::DrainSummary, SyncOperation, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    OperationQueued { operation: SyncOperation },
    OperationUpdated { operation: SyncOperation },
    SyncStarted { at: Timestamp },
    SyncCompleted { summary: DrainSummary },
    SyncFailed { error: String, at: Timestamp },
    ReachabilityChanged { reachable: bool },
}

impl SyncEvent {
    /// Event name as seen on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::OperationQueued { .. } => "operationQueued",
            SyncEvent::OperationUpdated { .. } => "operationUpdated",
            SyncEvent::SyncStarted { .. } => "syncStarted",
            SyncEvent::SyncCompleted { .. } => "syncCompleted",
            SyncEvent::SyncFailed { .. } => "syncFailed",
            SyncEvent::ReachabilityChanged { .. } => "reachabilityChanged",
        }
    }
}

/// Fan-out of [`SyncEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        let name = event.name();
        let receivers = self.tx.send(event).unwrap_or(0);
        tracing::trace!(event = name, receivers, "Event emitted");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::ReachabilityChanged { reachable: true });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SyncEvent::SyncStarted { at: 5 });

        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SyncStarted { at: 5 });
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for at in 0..5 {
            bus.emit(SyncEvent::SyncStarted { at });
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SyncStarted { at: 3 });
    }

    #[test]
    fn wire_format() {
        let json = serde_json::to_value(SyncEvent::ReachabilityChanged { reachable: false }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "reachabilityChanged", "reachable": false})
        );
        assert_eq!(
            SyncEvent::SyncFailed {
                error: "x".into(),
                at: 0
            }
            .name(),
            "syncFailed"
        );
    }
}
