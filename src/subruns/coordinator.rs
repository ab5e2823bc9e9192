//! Group evaluation and the engine-side coordination paths.

use serde_json::json;
use time::OffsetDateTime;

use crate::error::EngineError;
use crate::exec::ChildSpec;
use crate::model::{
    FailurePolicy, GroupId, JoinPolicy, LinkResolution, Run, RunId, RunStatus, StepKind,
    SubrunLink, ToolCallStatus, Topic, names,
};
use crate::quota::RateKind;
use crate::store::{Committed, StoreTxn};
use crate::engine::{Engine, machine};

/// Outcome of evaluating one spawn group against its children's states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupVerdict {
    /// Keep waiting.
    Pending,
    /// Join satisfied; parent resumes.
    Satisfied {
        resolution: LinkResolution,
        cancel_running: bool,
    },
    /// Failure policy violated or join unsatisfiable; parent fails.
    Failed { cancel_running: bool },
}

/// Pure group evaluation. `children` pairs each child with its current
/// status; `timed_out` says whether a `Timeout` policy deadline elapsed.
///
/// Order: failure policy, then join satisfaction, then exhaustion (every
/// child terminal but the join never satisfiable). First verdict wins.
pub fn evaluate_group(
    join: JoinPolicy,
    failure: FailurePolicy,
    children: &[(RunId, RunStatus)],
    timed_out: bool,
) -> GroupVerdict {
    let total = children.len();
    let succeeded = children
        .iter()
        .filter(|(_, s)| *s == RunStatus::Completed)
        .count();
    let failed = children
        .iter()
        .filter(|(_, s)| matches!(s, RunStatus::Failed | RunStatus::Canceled))
        .count();
    let running = total - succeeded - failed;

    if failed > 0 {
        match failure {
            FailurePolicy::FailFast => return GroupVerdict::Failed {
                cancel_running: false,
            },
            FailurePolicy::CancelSiblings => return GroupVerdict::Failed {
                cancel_running: true,
            },
            FailurePolicy::Tolerate => {}
        }
    }

    match join {
        JoinPolicy::Any => {
            if succeeded >= 1 {
                return GroupVerdict::Satisfied {
                    resolution: LinkResolution::Satisfied,
                    cancel_running: failure == FailurePolicy::CancelSiblings,
                };
            }
        }
        JoinPolicy::All => {
            if succeeded == total {
                return GroupVerdict::Satisfied {
                    resolution: LinkResolution::Satisfied,
                    cancel_running: false,
                };
            }
            // A tolerated failure still makes ALL unsatisfiable.
            if failed > 0 {
                return GroupVerdict::Failed {
                    cancel_running: false,
                };
            }
        }
        JoinPolicy::Quorum { n } => {
            if succeeded >= n as usize {
                return GroupVerdict::Satisfied {
                    resolution: LinkResolution::Satisfied,
                    cancel_running: true,
                };
            }
        }
        JoinPolicy::Timeout { .. } => {
            if timed_out {
                return GroupVerdict::Satisfied {
                    resolution: LinkResolution::TimedOut,
                    cancel_running: true,
                };
            }
            // Everything finished before the deadline: nothing left to wait
            // for, resolve early.
            if running == 0 {
                return GroupVerdict::Satisfied {
                    resolution: LinkResolution::Satisfied,
                    cancel_running: false,
                };
            }
            return GroupVerdict::Pending;
        }
    }

    if running == 0 {
        return GroupVerdict::Failed {
            cancel_running: false,
        };
    }
    GroupVerdict::Pending
}

/// Whether a `Timeout` group's deadline has elapsed, measured from the
/// earliest link of the group.
fn timeout_elapsed(links: &[SubrunLink]) -> bool {
    let Some(deadline) = links.first().and_then(|l| l.join_policy.timeout()) else {
        return false;
    };
    let Some(earliest) = links.iter().map(|l| l.created_at).min() else {
        return false;
    };
    earliest + deadline <= OffsetDateTime::now_utc()
}

impl Engine {
    /// Stages a spawn: admission checks first (so a refusal stages nothing),
    /// then child rows, links, the `SUBRUN_SPAWN` step, and the parent's
    /// transition to `WAITING_FOR_SUBRUN`.
    pub(crate) fn stage_spawn(
        &self,
        txn: &mut StoreTxn<'_>,
        parent_id: &RunId,
        specs: &[ChildSpec],
        join: JoinPolicy,
        failure: FailurePolicy,
    ) -> Result<GroupId, EngineError> {
        if specs.is_empty() {
            return Err(EngineError::InvalidCommand {
                reason: "spawn requires at least one child".into(),
            });
        }
        let parent = txn.run(parent_id)?.clone();
        self.quota
            .allow_rate(&parent.workspace_id, RateKind::Spawn)?;
        let current = txn.active_children_count(parent_id);
        self.quota
            .check_pending_children(current, specs.len() as u32)?;
        let (parents, total) = txn.active_counts(&parent.workspace_id);
        for i in 0..specs.len() as u32 {
            self.quota.check_run_counts(parents, total + i, false)?;
        }

        let group = GroupId::new();
        let mut child_ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let child = Run::child_of(&parent, spec.input_text.clone());
            txn.insert_link(SubrunLink::new(
                parent.id, child.id, group, join, failure,
            ));
            child_ids.push(child.id);
            txn.create_run(child)?;
        }
        txn.append_step(
            parent_id,
            StepKind::SubrunSpawn,
            json!({
                "group": group,
                "children": child_ids,
                "join": join.as_str(),
                "failure": failure.as_str(),
            }),
        )?;
        machine::transition(
            txn,
            parent_id,
            RunStatus::WaitingForSubrun,
            names::SUBRUN_SPAWNED,
            json!({"group": group, "children": child_ids}),
        )?;
        Ok(group)
    }

    /// Cancels a run and every non-terminal descendant, staging one
    /// `run_cancelled` event per run.
    pub(crate) fn stage_cancel_tree(
        &self,
        txn: &mut StoreTxn<'_>,
        root: &RunId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let mut queue = vec![*root];
        while let Some(id) = queue.pop() {
            for child in txn.children_of(&id) {
                queue.push(child.id);
            }
            let run = txn.run(&id)?.clone();
            if run.status.is_terminal() {
                continue;
            }
            let mut run = run;
            run.cancel_requested = true;
            txn.put_run(run)?;
            // Close any call still in flight or awaiting approval; the
            // active-call token is signaled post-commit.
            for status in [
                ToolCallStatus::WaitingForApproval,
                ToolCallStatus::Pending,
                ToolCallStatus::Running,
            ] {
                if let Some(call) = txn.latest_tool_call(&id, status)? {
                    txn.update_tool_call(&id, call.step_index, ToolCallStatus::Canceled, None)?;
                }
            }
            machine::transition(
                txn,
                &id,
                RunStatus::Canceled,
                names::RUN_CANCELLED,
                json!({"reason": reason}),
            )?;
        }
        Ok(())
    }

    /// Called (post-commit) for every child that reached a terminal state:
    /// emits the parent-stream notification and re-evaluates the group.
    pub(crate) fn child_finalized(&self, child: &Run) -> Result<Committed, EngineError> {
        let Some(link) = self.store.link_for_child(&child.id) else {
            return Ok(Committed::default());
        };
        let (_, committed) = self.store.transact(|txn| {
            let parent = txn.run(&link.parent_run_id)?.clone();
            let ev_name = if child.status == RunStatus::Canceled {
                names::SUBRUN_CANCELLED
            } else {
                names::SUBRUN_COMPLETED
            };
            txn.push_event(
                &parent.id,
                ev_name,
                Topic::Run,
                json!({
                    "child": child.id,
                    "status": child.status.as_str(),
                    "group": link.group_id,
                }),
            )?;
            if parent.status.is_terminal() || link.resolution.is_resolved() {
                return Ok(());
            }
            self.evaluate_and_apply(txn, &parent.id, &link.group_id)
        })?;
        Ok(committed)
    }

    /// One reconciliation sweep: re-evaluate every waiting parent's pending
    /// groups (this also fires `Timeout` deadlines). Returns how many
    /// parents were moved.
    pub fn reconcile_once(&self) -> usize {
        let mut moved = 0;
        for parent_id in self.store.waiting_parents() {
            let result = self.store.transact(|txn| {
                if txn.run(&parent_id)?.status != RunStatus::WaitingForSubrun {
                    return Ok(());
                }
                let mut groups: Vec<GroupId> = txn
                    .pending_links(&parent_id)
                    .iter()
                    .map(|l| l.group_id)
                    .collect();
                groups.sort();
                groups.dedup();
                for group in groups {
                    self.evaluate_and_apply(txn, &parent_id, &group)?;
                    if txn.run(&parent_id)?.status != RunStatus::WaitingForSubrun {
                        break;
                    }
                }
                Ok(())
            });
            match result {
                Ok((_, committed)) => {
                    if !committed.runs.is_empty() {
                        moved += 1;
                    }
                    self.finish_commit(committed);
                }
                Err(err) => {
                    tracing::error!(parent = %parent_id, error = %err, "reconcile failed");
                }
            }
        }
        moved
    }

    fn evaluate_and_apply(
        &self,
        txn: &mut StoreTxn<'_>,
        parent_id: &RunId,
        group: &GroupId,
    ) -> Result<(), EngineError> {
        let links = txn.group_links(parent_id, group);
        if links.is_empty() || links.iter().all(|l| l.resolution.is_resolved()) {
            return Ok(());
        }
        let mut children = Vec::with_capacity(links.len());
        for l in &links {
            children.push((l.child_run_id, txn.run(&l.child_run_id)?.status));
        }
        let join = links[0].join_policy;
        let failure = links[0].failure_policy;
        let verdict = evaluate_group(join, failure, &children, timeout_elapsed(&links));

        match verdict {
            GroupVerdict::Pending => Ok(()),
            GroupVerdict::Satisfied {
                resolution,
                cancel_running,
            } => {
                for l in &links {
                    txn.resolve_link(&l.child_run_id, resolution);
                }
                if cancel_running {
                    for (child_id, status) in &children {
                        if !status.is_terminal() {
                            self.stage_cancel_tree(txn, child_id, "sibling pruned")?;
                        }
                    }
                }
                if txn.run(parent_id)?.status == RunStatus::WaitingForSubrun {
                    machine::transition(
                        txn,
                        parent_id,
                        RunStatus::Running,
                        names::STATE_CHANGED,
                        json!({"group": group, "resolution": resolution}),
                    )?;
                }
                Ok(())
            }
            GroupVerdict::Failed { cancel_running } => {
                for l in &links {
                    txn.resolve_link(&l.child_run_id, LinkResolution::Failed);
                }
                if cancel_running {
                    for (child_id, status) in &children {
                        if !status.is_terminal() {
                            self.stage_cancel_tree(txn, child_id, "sibling pruned")?;
                        }
                    }
                }
                if !txn.run(parent_id)?.status.is_terminal() {
                    let mut parent = txn.run(parent_id)?.clone();
                    parent.error_summary = "join policy violated".into();
                    txn.put_run(parent)?;
                    machine::transition(
                        txn,
                        parent_id,
                        RunStatus::Failed,
                        names::RUN_FAILED,
                        json!({"group": group, "reason": "join policy violated"}),
                    )?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<RunId> {
        (0..n).map(|_| RunId::new()).collect()
    }

    fn with_statuses(ids: &[RunId], statuses: &[RunStatus]) -> Vec<(RunId, RunStatus)> {
        ids.iter().copied().zip(statuses.iter().copied()).collect()
    }

    #[test]
    fn test_all_waits_then_satisfies() {
        let c = ids(2);
        let pending = with_statuses(&c, &[RunStatus::Completed, RunStatus::Running]);
        assert_eq!(
            evaluate_group(JoinPolicy::All, FailurePolicy::Tolerate, &pending, false),
            GroupVerdict::Pending
        );
        let done = with_statuses(&c, &[RunStatus::Completed, RunStatus::Completed]);
        assert_eq!(
            evaluate_group(JoinPolicy::All, FailurePolicy::Tolerate, &done, false),
            GroupVerdict::Satisfied {
                resolution: LinkResolution::Satisfied,
                cancel_running: false
            }
        );
    }

    #[test]
    fn test_fail_fast_beats_join_satisfaction() {
        let c = ids(2);
        let mixed = with_statuses(&c, &[RunStatus::Completed, RunStatus::Failed]);
        assert_eq!(
            evaluate_group(JoinPolicy::Any, FailurePolicy::FailFast, &mixed, false),
            GroupVerdict::Failed {
                cancel_running: false
            }
        );
        assert_eq!(
            evaluate_group(JoinPolicy::Any, FailurePolicy::CancelSiblings, &mixed, false),
            GroupVerdict::Failed {
                cancel_running: true
            }
        );
    }

    #[test]
    fn test_tolerated_failure_keeps_any_alive() {
        let c = ids(3);
        let mixed = with_statuses(
            &c,
            &[RunStatus::Failed, RunStatus::Running, RunStatus::Running],
        );
        assert_eq!(
            evaluate_group(JoinPolicy::Any, FailurePolicy::Tolerate, &mixed, false),
            GroupVerdict::Pending
        );
        let won = with_statuses(
            &c,
            &[RunStatus::Failed, RunStatus::Completed, RunStatus::Running],
        );
        assert_eq!(
            evaluate_group(JoinPolicy::Any, FailurePolicy::Tolerate, &won, false),
            GroupVerdict::Satisfied {
                resolution: LinkResolution::Satisfied,
                cancel_running: false
            }
        );
    }

    #[test]
    fn test_tolerated_failure_makes_all_unsatisfiable() {
        let c = ids(2);
        let mixed = with_statuses(&c, &[RunStatus::Failed, RunStatus::Running]);
        assert_eq!(
            evaluate_group(JoinPolicy::All, FailurePolicy::Tolerate, &mixed, false),
            GroupVerdict::Failed {
                cancel_running: false
            }
        );
    }

    #[test]
    fn test_quorum_prunes_stragglers() {
        let c = ids(3);
        let two_done = with_statuses(
            &c,
            &[RunStatus::Completed, RunStatus::Completed, RunStatus::Running],
        );
        assert_eq!(
            evaluate_group(
                JoinPolicy::Quorum { n: 2 },
                FailurePolicy::Tolerate,
                &two_done,
                false
            ),
            GroupVerdict::Satisfied {
                resolution: LinkResolution::Satisfied,
                cancel_running: true
            }
        );
    }

    #[test]
    fn test_quorum_exhaustion_fails_parent() {
        let c = ids(3);
        let exhausted = with_statuses(
            &c,
            &[RunStatus::Completed, RunStatus::Failed, RunStatus::Failed],
        );
        assert_eq!(
            evaluate_group(
                JoinPolicy::Quorum { n: 2 },
                FailurePolicy::Tolerate,
                &exhausted,
                false
            ),
            GroupVerdict::Failed {
                cancel_running: false
            }
        );
    }

    #[test]
    fn test_timeout_fires_regardless_of_outcomes() {
        let c = ids(2);
        let running = with_statuses(&c, &[RunStatus::Running, RunStatus::Running]);
        let join = JoinPolicy::Timeout {
            deadline: std::time::Duration::from_secs(60),
        };
        assert_eq!(
            evaluate_group(join, FailurePolicy::Tolerate, &running, false),
            GroupVerdict::Pending
        );
        assert_eq!(
            evaluate_group(join, FailurePolicy::Tolerate, &running, true),
            GroupVerdict::Satisfied {
                resolution: LinkResolution::TimedOut,
                cancel_running: true
            }
        );
    }

    #[test]
    fn test_timeout_resolves_early_when_all_terminal() {
        let c = ids(2);
        let done = with_statuses(&c, &[RunStatus::Completed, RunStatus::Completed]);
        let join = JoinPolicy::Timeout {
            deadline: std::time::Duration::from_secs(60),
        };
        assert_eq!(
            evaluate_group(join, FailurePolicy::Tolerate, &done, false),
            GroupVerdict::Satisfied {
                resolution: LinkResolution::Satisfied,
                cancel_running: false
            }
        );
    }
}
