//! # Run row and status machine.
//!
//! A [`Run`] is one long-lived state-machine instance. The row is the only
//! resource in the system that requires exclusive access: it is mutated solely
//! through store transactions while the mutating worker holds the run's lease.
//!
//! ## Status graph
//! ```text
//! PENDING ──► RUNNING ──► { WAITING_FOR_APPROVAL, WAITING_FOR_SUBRUN,
//!                           PAUSED, COMPLETED, FAILED, CANCELED }
//! waiting states ──► RUNNING (approval / join satisfied / resume command)
//! any non-terminal ──► PAUSED | CANCELED (external command)
//! ```
//! `COMPLETED`, `FAILED`, and `CANCELED` are terminal. Every legal edge is
//! encoded in [`RunStatus::can_transition_to`]; callers never mutate `status`
//! without consulting it.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ids::{CorrelationId, RunId, WorkspaceId};

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created, waiting for its first tick.
    Pending,
    /// Actively advancing through steps.
    Running,
    /// Frozen by an external command; ticks are no-ops until resumed.
    Paused,
    /// Parked until an approval or rejection arrives for a risky tool call.
    WaitingForApproval,
    /// Parked until the sub-run coordinator resumes or fails the run.
    WaitingForSubrun,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished with an error. Terminal.
    Failed,
    /// Cancelled by command or cascade. Terminal.
    Canceled,
}

impl RunStatus {
    /// Returns true for `Completed`, `Failed`, and `Canceled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Returns true when the run is parked waiting on an external signal.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            RunStatus::WaitingForApproval | RunStatus::WaitingForSubrun
        )
    }

    /// Whether `self -> next` is a legal edge of the status graph.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match self {
            Pending => matches!(next, Running | Canceled | Failed | WaitingForSubrun),
            Running => matches!(
                next,
                Completed
                    | Failed
                    | Canceled
                    | WaitingForApproval
                    | WaitingForSubrun
                    | Paused
            ),
            Paused => matches!(next, Running | Failed | Canceled),
            WaitingForApproval => matches!(next, Running | Failed | Canceled),
            WaitingForSubrun => matches!(next, Running | Failed | Canceled),
            Completed | Failed | Canceled => false,
        }
    }

    /// Short stable label (SCREAMING_SNAKE_CASE) for logs and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::WaitingForApproval => "WAITING_FOR_APPROVAL",
            RunStatus::WaitingForSubrun => "WAITING_FOR_SUBRUN",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Canceled => "CANCELED",
        }
    }
}

/// One run row.
///
/// `cursor` is the optimistic tick counter: every committed mutation bumps it
/// by exactly one, and a tick whose expected cursor does not match is a
/// stale duplicate and never advances state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workspace_id: WorkspaceId,
    pub status: RunStatus,
    /// Commit counter used for duplicate/stale tick detection.
    pub cursor: u64,
    /// Index of the last appended step (0 = no steps yet).
    pub step_count: u64,
    pub parent_run_id: Option<RunId>,
    pub correlation_id: CorrelationId,
    pub cancel_requested: bool,
    pub input_text: String,
    pub final_text: String,
    pub error_summary: String,
    /// Step budget; exceeding it fails the run.
    pub max_steps: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
}

impl Run {
    /// Creates a fresh `Pending` run.
    pub fn new(workspace_id: WorkspaceId, input_text: impl Into<String>, max_steps: u64) -> Self {
        Self {
            id: RunId::new(),
            workspace_id,
            status: RunStatus::Pending,
            cursor: 0,
            step_count: 0,
            parent_run_id: None,
            correlation_id: CorrelationId::new(),
            cancel_requested: false,
            input_text: input_text.into(),
            final_text: String::new(),
            error_summary: String::new(),
            max_steps,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Creates a child run inheriting workspace, budget, and correlation id
    /// from its parent.
    pub fn child_of(parent: &Run, input_text: impl Into<String>) -> Self {
        let mut run = Self::new(parent.workspace_id, input_text, parent.max_steps);
        run.parent_run_id = Some(parent.id);
        run.correlation_id = parent.correlation_id;
        run
    }

    /// A parent run is one with no parent of its own.
    pub fn is_parent(&self) -> bool {
        self.parent_run_id.is_none()
    }
}
