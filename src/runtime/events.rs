//! Provider event hub.
//!
//! Each provider owns one [`EventBus`]. Events are fanned out over a
//! `tokio::sync::broadcast` channel, so emitting never blocks and a slow
//! subscriber only loses its own backlog.

use super::{EventKind, RuntimeEvent};
use crate::constants::EVENT_CHANNEL_CAPACITY;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Broadcast hub for [`RuntimeEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    pub fn emit(&self, event: RuntimeEvent) {
        tracing::trace!(kind = ?event.kind(), runtime = ?event.runtime_id(), "emitting event");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    /// Returns a receiver for every subsequent event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    /// Runs `handler` for each subsequent event of `kind`.
    ///
    /// The handler runs on a spawned task until the bus is dropped or the
    /// returned handle is aborted. Must be called inside a Tokio runtime.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> JoinHandle<()>
    where
        F: Fn(RuntimeEvent) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => handler(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(?kind, skipped, "event handler lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
