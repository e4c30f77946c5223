//! Session events delivered to UI collaborators.
//!
//! The bus is a bounded broadcast channel: subscribers that stop reading
//! miss old events instead of growing an unbounded queue, and dropping a
//! receiver is the unsubscribe.

use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Terminal auth failure. Emitted exactly once per failure; the UI
    /// should prompt for sign-in.
    AuthRequired,
    /// The active account changed to the given user id.
    SessionSwitched(String),
    /// The set of known accounts changed.
    SessionListChanged,
    /// The realtime channel gave up reconnecting.
    RealtimeOffline,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Send to all current subscribers. No subscribers is not an error.
    pub(crate) fn emit(&self, event: SessionEvent) {
        debug!(?event, "session event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
