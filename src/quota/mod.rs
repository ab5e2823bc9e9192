//! # Quota governor: admission control for runs, spawns, and snapshots.
//!
//! Two kinds of ceiling, both configured by [`crate::QuotaLimits`]:
//!
//! - **Concurrency counts** — active parent runs, active total runs, and
//!   unresolved children per parent. The counts themselves come from the
//!   store (inside the admitting transaction, so check and insert are
//!   atomic); the governor only compares them against the limits.
//! - **Rates** — token buckets per `(workspace, kind)` for run creation,
//!   sub-run spawns, and snapshot reads.
//!
//! The governor also owns the one-pending-approval-per-run reservation.
//!
//! ## Rules
//! - A refusal is an [`crate::EngineError::QuotaExceeded`] naming the limit.
//! - `0` counts and `0.0` rates mean unlimited.

mod bucket;
mod governor;

pub use governor::{QuotaGovernor, RateKind};
