//! # Non-blocking push fan-out to multiple subscribers.
//!
//! ```text
//! emit(msg)
//!     ├──► [queue 1] ──► worker 1 ──► subscriber1.on_push()
//!     │    (bounded)         └──────► panic → caught, logged
//!     ├──► [queue 2] ──► worker 2 ──► subscriber2.on_push()
//!     └──► [queue N] ──► worker N ──► subscriberN.on_push()
//! ```
//!
//! ## Rules
//! - **No cross-subscriber ordering**: subscriber A may process message N
//!   while B processes N+5. Per-subscriber order is FIFO.
//! - **Overflow**: message dropped for that subscriber only, logged as warn.
//!   The event log still holds it; nothing is lost durably.
//! - **Non-blocking**: `emit_arc()` returns immediately (uses `try_send`).
//! - **Isolation**: a slow or panicking subscriber does not affect others.
//!   Worker tasks use `catch_unwind`; a panic is logged and the worker keeps
//!   processing.

use std::sync::Arc;

use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};

use super::envelope::PushMessage;
use super::subscribe::Subscribe;

struct SubscriberChannel {
    name: &'static str,
    sender: mpsc::Sender<Arc<PushMessage>>,
}

/// Fan-out coordinator: one bounded queue and one worker task per
/// subscriber.
pub struct SubscriberSet {
    channels: Vec<SubscriberChannel>,
    workers: Vec<JoinHandle<()>>,
}

impl SubscriberSet {
    /// Creates a new set and spawns one worker task per subscriber.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>) -> Self {
        let mut channels = Vec::with_capacity(subs.len());
        let mut workers = Vec::with_capacity(subs.len());

        for sub in subs {
            let cap = sub.queue_capacity().max(1);
            let name = sub.name();
            let (tx, mut rx) = mpsc::channel::<Arc<PushMessage>>(cap);
            let s = Arc::clone(&sub);

            let handle = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    let fut = s.on_push(msg.as_ref());

                    if let Err(panic_err) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        let info = {
                            let any = &*panic_err;
                            if let Some(msg) = any.downcast_ref::<&'static str>() {
                                (*msg).to_string()
                            } else if let Some(msg) = any.downcast_ref::<String>() {
                                msg.clone()
                            } else {
                                "unknown panic".to_string()
                            }
                        };
                        tracing::error!(subscriber = s.name(), panic = %info, "push subscriber panicked");
                    }
                }
            });
            channels.push(SubscriberChannel { name, sender: tx });
            workers.push(handle);
        }
        Self { channels, workers }
    }

    /// Emits a message to all subscribers (clones into an `Arc`).
    pub fn emit(&self, msg: &PushMessage) {
        self.emit_arc(Arc::new(msg.clone()));
    }

    /// Emits a pre-allocated `Arc<PushMessage>` to all subscribers.
    ///
    /// On a full or closed queue the message is dropped for that subscriber
    /// and a warning is logged.
    pub fn emit_arc(&self, msg: Arc<PushMessage>) {
        for channel in &self.channels {
            match channel.sender.try_send(Arc::clone(&msg)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = channel.name,
                        channel = %msg.channel,
                        "push queue full; message dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!(
                        subscriber = channel.name,
                        channel = %msg.channel,
                        "push queue closed; message dropped"
                    );
                }
            }
        }
    }

    /// Gracefully shuts down all subscriber workers.
    ///
    /// 1. Drops all channel senders (workers see channel closed).
    /// 2. Awaits all worker tasks to finish.
    pub async fn shutdown(self) {
        drop(self.channels);

        for h in self.workers {
            let _ = h.await;
        }
    }
}
