//! # Sub-run coordinator: fan-out, join, and failure propagation.
//!
//! A parent spawns a group of children and parks in `WAITING_FOR_SUBRUN`.
//! Every child that reaches a terminal state re-evaluates the group; a
//! periodic reconciliation sweep re-evaluates any parent still waiting and
//! fires timeout deadlines, so no parent is left waiting forever even if a
//! finalization raced a crash.
//!
//! ```text
//! child terminal ──► child_finalized ──┐
//!                                      ├──► evaluate_group ──► verdict
//! reconcile sweep ──► waiting parents ─┘          │
//!                                                 ├─ Pending:   keep waiting
//!                                                 ├─ Satisfied: resolve links,
//!                                                 │             prune if asked,
//!                                                 │             parent ► RUNNING
//!                                                 └─ Failed:    resolve links,
//!                                                               parent ► FAILED
//! ```
//!
//! ## Rules
//! - Evaluation order: failure policy first, then join satisfaction, then
//!   exhaustion. The first verdict wins.
//! - A resolved link is immutable; re-finalizations only emit the child
//!   notification event.
//! - Pruned siblings are cancelled through the normal cancel cascade, so
//!   their own descendants are cancelled too.

mod coordinator;

pub use coordinator::{GroupVerdict, evaluate_group};
