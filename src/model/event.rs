//! # Committed event records.
//!
//! Events are the authoritative change log: every run mutation is paired with
//! at least one event append in the same transaction, and the per-run `seq`
//! is assigned only by the store at commit time. Once committed an event is
//! immutable; payload shapes are never mutated in place — a new event name is
//! introduced instead.
//!
//! ## Event names
//! The known names mirror the transitions that produce them:
//! - [`names::STATE_CHANGED`] — plain status transition `{from, to, steps}`
//! - [`names::STEPS_APPENDED`] — a tick appended steps without changing status
//! - [`names::TOOL_CALL_REQUESTED`] / [`names::TOOL_CALL_APPROVED`] /
//!   [`names::TOOL_CALL_REJECTED`] — approval lifecycle (also pushed on the
//!   `approvals` topic)
//! - [`names::RUN_CANCELLED`], [`names::RUN_FAILED`] — terminal transitions
//!   with a reason
//! - [`names::SUBRUN_SPAWNED`], [`names::SUBRUN_COMPLETED`],
//!   [`names::SUBRUN_CANCELLED`] — parent-stream notifications about children

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::ids::{CorrelationId, RunId, WorkspaceId};

/// Known event names. String constants rather than an enum so projections can
/// skip unknown names instead of failing to deserialize newer logs.
pub mod names {
    pub const STATE_CHANGED: &str = "state_changed";
    pub const STEPS_APPENDED: &str = "steps_appended";
    pub const TOOL_CALL_REQUESTED: &str = "tool_call_requested";
    pub const TOOL_CALL_APPROVED: &str = "tool_call_approved";
    pub const TOOL_CALL_REJECTED: &str = "tool_call_rejected";
    pub const RUN_CANCELLED: &str = "run_cancelled";
    pub const RUN_FAILED: &str = "run_failed";
    pub const SUBRUN_SPAWNED: &str = "subrun_spawned";
    pub const SUBRUN_COMPLETED: &str = "subrun_completed";
    pub const SUBRUN_CANCELLED: &str = "subrun_cancelled";
}

/// Broadcast scope of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// Run-scoped: pushed to `run.<run_id>` only.
    Run,
    /// Also pushed to `workspace.<workspace_id>` watchers.
    Workspace,
    /// Also pushed to `approvals.<workspace_id>` watchers.
    Approvals,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Run => "run",
            Topic::Workspace => "workspace",
            Topic::Approvals => "approvals",
        }
    }
}

/// One committed event. `seq` is strictly increasing and duplicate-free
/// within a run; there is no cross-run ordering guarantee.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub run_id: RunId,
    pub workspace_id: WorkspaceId,
    pub seq: u64,
    pub name: String,
    pub topic: Topic,
    pub payload: Value,
    pub correlation_id: CorrelationId,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}
