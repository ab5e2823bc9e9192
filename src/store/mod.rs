//! # Event store: the single source of truth.
//!
//! Every run mutation goes through [`MemoryStore::transact`]: a closure
//! stages changes against a [`StoreTxn`], and the store applies them
//! atomically only if the closure returns `Ok`. Per-run event sequence
//! numbers are allocated at apply time, under the same lock that serializes
//! all writers, so they are gapless and duplicate-free per run.
//!
//! ```text
//!  caller ──► transact(|txn| { read, stage steps/events/rows })
//!                 │ Ok                         │ Err
//!                 ▼                            ▼
//!          apply staging, assign seq     drop staging
//!          return Committed              nothing persisted,
//!          (broadcast happens AFTER)     nothing broadcast
//! ```
//!
//! ## Rules
//! - Events are broadcast only from a [`Committed`] value, never from inside
//!   a transaction. A failed transaction leaves no observable trace.
//! - `seq` and `step_index` are allocated by the store, never by callers.
//! - Committed events and steps are immutable.

mod memory;
mod txn;

pub use memory::MemoryStore;
pub use txn::{Committed, StoreTxn};
