//! # Push bus.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`] that provides
//! non-blocking publishing of push messages from the engine's commit path.
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never blocks.
//! - **Bounded capacity**: a single ring buffer stores recent messages for
//!   all receivers; slow receivers observe `RecvError::Lagged(n)` and skip
//!   the `n` oldest items.
//! - **No persistence**: messages sent while nobody listens are dropped.
//!   The event log is the durable record, not the bus.

use tokio::sync::broadcast;

use super::envelope::PushMessage;

/// Broadcast channel for push messages.
///
/// Cheap to clone (internally holds an `Arc`-backed sender); multiple
/// publishers can publish concurrently and every receiver sees its own
/// clone of each message.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<PushMessage>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<PushMessage>(capacity);
        Self { tx }
    }

    /// Publishes a message to all active receivers. If there are none, the
    /// message is dropped.
    pub fn publish(&self, msg: PushMessage) {
        let _ = self.tx.send(msg);
    }

    /// Creates an independent receiver observing messages sent after this
    /// call.
    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.tx.subscribe()
    }
}
