//! # Per-run leases.
//!
//! A lease is the single-writer guarantee for a run: a worker must hold the
//! run's lease for the whole tick, renewing it while awaiting external calls.
//! Acquisition is non-blocking; a held lease means the tick reports `Busy`
//! and is re-enqueued with backoff.
//!
//! ## Rules
//! - Leases are fenced: every acquisition gets a fresh token, and renew /
//!   release are no-ops for a stale token.
//! - An expired lease is reclaimable immediately; the reaper sweep also
//!   clears it and schedules a recovery tick for the orphaned run.

mod manager;

pub use manager::{Lease, LeaseManager};
