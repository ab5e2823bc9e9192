//! # Broadcast gateway: committed events out to watchers.
//!
//! ```text
//! store commit ──► Committed ──► Engine::finish_commit
//!                                     │ publish per channel
//!                                     ▼
//!                                    Bus ──► push_listener ──► SubscriberSet
//!                                  (broadcast chan)              │ bounded queue per subscriber
//!                                                                ▼
//!                                                        subscriber.on_push()
//! ```
//!
//! ## Rules
//! - Only committed events are ever pushed; a rolled-back transaction
//!   produces no messages.
//! - Every event is pushed on its run channel (`run.<run_id>`). Events with
//!   a wider topic are additionally pushed on `workspace.<workspace_id>` or
//!   `approvals.<workspace_id>`.
//! - Push is fire-and-forget: no delivery guarantee, no persistence. Clients
//!   recover gaps by reading the event log with `since_seq`.

mod bus;
mod envelope;
mod fanout;
mod log;
mod subscribe;

pub use bus::Bus;
pub use envelope::PushMessage;
pub use fanout::SubscriberSet;
pub use log::LogWriter;
pub use subscribe::Subscribe;
