//! # Observer Event Channel
//!
//! Append-only stream of application events consumed by the UI, the log
//! pane, or any other observer. The core publishes and forgets: sends
//! never block, and when the buffer overflows the oldest events are
//! dropped for lagging consumers.
//!
//! The decoders and the sync engine hold an [`EventBus`] handle instead of
//! a callback into UI state, so the core never references its observers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::AnalyzerType;
use crate::EVENT_BUFFER;

// =============================================================================
// Event Types
// =============================================================================

/// Lifecycle state of a listener, as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    /// Bound and accepting connections.
    Online,
    /// Closed (shutdown or removed by reload).
    Offline,
}

/// Outcome of one outbound sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Endpoint returned 2xx; rows committed as synced.
    Synced,
    /// Transient failure; rows rescheduled.
    Retrying,
    /// Endpoint rejected the batch permanently; rows poisoned.
    Poisoned,
}

/// A one-line description of an ingested message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub analyzer: AnalyzerType,
    pub patient_id: String,
    pub sample_id: String,
    pub result_count: usize,
}

/// Events published by the core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    /// A listener came online or went offline.
    ListenerStateChanged {
        port: u16,
        state: ListenerState,
        client_count: usize,
    },

    /// A complete message was decoded and durably stored.
    MessageIngested { port: u16, summary: MessageSummary },

    /// The sync engine finished one delivery attempt.
    SyncAttempt {
        outcome: SyncOutcome,
        attempts: i64,
        results: usize,
        detail: String,
    },

    /// Recoverable problem (bad frame, dropped record, transient sync
    /// failure).
    Warning { kind: String, detail: String },

    /// Non-recoverable problem on one connection or subsystem. The
    /// process keeps running.
    Error { kind: String, detail: String },
}

// =============================================================================
// Event Bus
// =============================================================================

/// Broadcast bus carrying [`AppEvent`]s to any number of observers.
///
/// Cheap to clone; every clone publishes into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    /// Creates a bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    /// Creates a bus with an explicit buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publishes an event. Never blocks; if no observer is subscribed the
    /// event is discarded.
    pub fn publish(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    /// Convenience for warning events.
    pub fn warn(&self, kind: &str, detail: impl Into<String>) {
        self.publish(AppEvent::Warning {
            kind: kind.to_string(),
            detail: detail.into(),
        });
    }

    /// Convenience for error events.
    pub fn error(&self, kind: &str, detail: impl Into<String>) {
        self.publish(AppEvent::Error {
            kind: kind.to_string(),
            detail: detail.into(),
        });
    }

    /// Subscribes a new observer. A receiver that falls more than the
    /// buffer capacity behind skips the oldest events (`RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
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

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(AppEvent::ListenerStateChanged {
            port: 5000,
            state: ListenerState::Online,
            client_count: 0,
        });

        match rx.recv().await.unwrap() {
            AppEvent::ListenerStateChanged { port, state, .. } => {
                assert_eq!(port, 5000);
                assert_eq!(state, ListenerState::Online);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        // No subscriber; must not panic or block.
        bus.warn("framing", "checksum mismatch");
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let bus = EventBus::with_capacity(4);
        let mut rx = bus.subscribe();

        for i in 0..16u16 {
            bus.publish(AppEvent::ListenerStateChanged {
                port: i,
                state: ListenerState::Online,
                client_count: 0,
            });
        }

        // The slow receiver lags, then continues from the newest window.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            other => panic!("expected lag, got {:?}", other),
        }
        assert!(rx.recv().await.is_ok());
    }
}
