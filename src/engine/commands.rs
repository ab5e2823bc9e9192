//! # External command surface.
//!
//! Commands mutate runs without holding a lease: every command commit bumps
//! the run's cursor, so any tick that was computed against the old cursor
//! fails its guard and is dropped as stale. That is what makes commands safe
//! to apply at any time, including while a tick is in flight.

use serde_json::json;
use tokio::sync::broadcast;

use crate::error::EngineError;
use crate::exec::ChildSpec;
use crate::gateway::PushMessage;
use crate::model::{
    FailurePolicy, GroupId, JoinPolicy, Run, RunId, RunStatus, StepKind, ToolCallStatus,
    WorkspaceId, names,
};
use crate::quota::RateKind;
use crate::snapshot::{ChildSummary, ReplayResponse, RunSnapshot};

use super::Engine;
use super::machine;

impl Engine {
    /// Creates a new top-level run in `Pending` and schedules its first tick.
    pub fn create_run(
        &self,
        workspace_id: WorkspaceId,
        input_text: impl Into<String>,
    ) -> Result<Run, EngineError> {
        self.quota.allow_rate(&workspace_id, RateKind::RunCreation)?;
        let input_text = input_text.into();
        let (run_id, committed) = self.store.transact(|txn| {
            let (parents, total) = txn.active_counts(&workspace_id);
            self.quota.check_run_counts(parents, total, true)?;
            let run = Run::new(workspace_id, input_text.clone(), self.cfg.max_steps);
            let id = run.id;
            txn.create_run(run)?;
            Ok(id)
        })?;
        tracing::info!(run = %run_id, workspace = %workspace_id, "run created");
        // The committed row carries the post-commit cursor.
        let run = committed
            .runs
            .iter()
            .find(|r| r.id == run_id)
            .cloned()
            .ok_or(crate::error::StoreError::Unavailable)?;
        self.finish_commit(committed);
        Ok(run)
    }

    /// Spawns a group of children under an already-running parent. Most
    /// spawns come from model directives; this is the operator-driven path.
    pub fn spawn_subruns(
        &self,
        parent_id: RunId,
        specs: Vec<ChildSpec>,
        join: JoinPolicy,
        failure: FailurePolicy,
    ) -> Result<GroupId, EngineError> {
        let (group, committed) = self.store.transact(|txn| {
            if txn.run(&parent_id)?.status != RunStatus::Running {
                return Err(EngineError::InvalidCommand {
                    reason: "spawn requires a running parent".into(),
                });
            }
            self.stage_spawn(txn, &parent_id, &specs, join, failure)
        })?;
        self.finish_commit(committed);
        Ok(group)
    }

    /// Approves the pending tool call of a run parked in
    /// `WAITING_FOR_APPROVAL`; the next tick executes the cleared call.
    pub fn approve_tool_call(&self, run_id: RunId) -> Result<(), EngineError> {
        let (_, committed) = self.store.transact(|txn| {
            if txn.run(&run_id)?.status != RunStatus::WaitingForApproval {
                return Err(EngineError::InvalidCommand {
                    reason: "run is not waiting for approval".into(),
                });
            }
            let call = txn
                .latest_tool_call(&run_id, ToolCallStatus::WaitingForApproval)?
                .ok_or_else(|| EngineError::InvalidCommand {
                    reason: "no tool call awaiting approval".into(),
                })?;
            txn.update_tool_call(&run_id, call.step_index, ToolCallStatus::Pending, None)?;
            machine::transition(
                txn,
                &run_id,
                RunStatus::Running,
                names::TOOL_CALL_APPROVED,
                json!({"tool": call.tool_name, "step_index": call.step_index}),
            )
        })?;
        self.quota.release_approval(&run_id);
        self.finish_commit(committed);
        Ok(())
    }

    /// Rejects the pending tool call. With `fail_run` the run fails
    /// immediately; otherwise it resumes and the model sees the rejection
    /// as a failed observation.
    pub fn reject_tool_call(&self, run_id: RunId, fail_run: bool) -> Result<(), EngineError> {
        let (_, committed) = self.store.transact(|txn| {
            if txn.run(&run_id)?.status != RunStatus::WaitingForApproval {
                return Err(EngineError::InvalidCommand {
                    reason: "run is not waiting for approval".into(),
                });
            }
            let call = txn
                .latest_tool_call(&run_id, ToolCallStatus::WaitingForApproval)?
                .ok_or_else(|| EngineError::InvalidCommand {
                    reason: "no tool call awaiting approval".into(),
                })?;
            txn.update_tool_call(
                &run_id,
                call.step_index,
                ToolCallStatus::Failed,
                Some(json!({"rejected": true})),
            )?;
            txn.append_step(
                &run_id,
                StepKind::Observation,
                json!({"ok": false, "tool": call.tool_name, "error": "rejected by operator"}),
            )?;
            if fail_run {
                let mut run = txn.run(&run_id)?.clone();
                run.error_summary = format!("tool call '{}' rejected", call.tool_name);
                txn.put_run(run)?;
                machine::transition(
                    txn,
                    &run_id,
                    RunStatus::Failed,
                    names::RUN_FAILED,
                    json!({"reason": "tool call rejected", "tool": call.tool_name}),
                )
            } else {
                machine::transition(
                    txn,
                    &run_id,
                    RunStatus::Running,
                    names::TOOL_CALL_REJECTED,
                    json!({"tool": call.tool_name, "step_index": call.step_index}),
                )
            }
        })?;
        self.quota.release_approval(&run_id);
        self.finish_commit(committed);
        Ok(())
    }

    /// Freezes a running run; subsequent ticks are no-ops until resumed.
    pub fn pause(&self, run_id: RunId) -> Result<(), EngineError> {
        let (_, committed) = self.store.transact(|txn| {
            machine::transition(
                txn,
                &run_id,
                RunStatus::Paused,
                names::STATE_CHANGED,
                json!({}),
            )
        })?;
        self.finish_commit(committed);
        Ok(())
    }

    /// Resumes a paused run and schedules a tick.
    pub fn resume(&self, run_id: RunId) -> Result<(), EngineError> {
        let (_, committed) = self.store.transact(|txn| {
            machine::transition(
                txn,
                &run_id,
                RunStatus::Running,
                names::STATE_CHANGED,
                json!({}),
            )
        })?;
        self.finish_commit(committed);
        Ok(())
    }

    /// Cancels a run and its whole descendant tree. Idempotent: already
    /// terminal runs are left untouched.
    pub fn cancel(&self, run_id: RunId, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        let (_, committed) = self
            .store
            .transact(|txn| self.stage_cancel_tree(txn, &run_id, &reason))?;
        self.finish_commit(committed);
        Ok(())
    }

    /// Re-opens a failed run and schedules a tick. The model resumes from
    /// the existing step ledger.
    pub fn retry_run(&self, run_id: RunId) -> Result<(), EngineError> {
        let (_, committed) = self
            .store
            .transact(|txn| machine::retry_transition(txn, &run_id))?;
        self.finish_commit(committed);
        Ok(())
    }

    /// Full point-in-time view of a run, children included.
    pub fn snapshot(&self, run_id: RunId) -> Result<RunSnapshot, EngineError> {
        let run = self.store.get_run(&run_id)?;
        self.quota.allow_rate(&run.workspace_id, RateKind::Snapshot)?;
        let steps = self.store.steps(&run_id)?;
        let events = self.store.read_since(&run_id, 0)?;
        let tool_calls = self.store.tool_calls(&run_id)?;
        let mut children = Vec::new();
        for child in self.store.children_of(&run_id) {
            if let Some(link) = self.store.link_for_child(&child.id) {
                children.push(ChildSummary {
                    run_id: child.id,
                    status: child.status,
                    group_id: link.group_id,
                    join_policy: link.join_policy,
                    failure_policy: link.failure_policy,
                    resolution: link.resolution,
                });
            }
        }
        Ok(RunSnapshot {
            run,
            steps,
            events,
            tool_calls,
            children,
        })
    }

    /// Resynchronizes a reconnecting client: the event tail past
    /// `since_seq`, or a full snapshot when no resume point is given.
    pub fn replay(
        &self,
        run_id: RunId,
        since_seq: Option<u64>,
    ) -> Result<ReplayResponse, EngineError> {
        match since_seq {
            Some(since) => Ok(ReplayResponse::Events {
                events: self.store.read_since(&run_id, since)?,
            }),
            None => Ok(ReplayResponse::Snapshot {
                snapshot: self.snapshot(run_id)?,
            }),
        }
    }

    /// Live push stream. Receivers that lag behind the bus capacity skip
    /// older messages; clients recover via [`Engine::replay`].
    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.bus.subscribe()
    }
}
