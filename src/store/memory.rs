//! In-memory store backend.
//!
//! One global `Mutex` serializes all writers; a transaction is a closure run
//! under that lock against a [`StoreTxn`] staging area. Reads outside
//! transactions take the same lock briefly and clone what they return.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{EngineError, StoreError};
use crate::model::{
    EventRecord, GroupId, Run, RunId, RunStatus, Step, SubrunLink, ToolCall,
};

use super::txn::{Committed, StoreTxn};

/// Everything the store knows about one run.
#[derive(Clone, Debug)]
pub(super) struct RunRecord {
    pub(super) run: Run,
    pub(super) steps: Vec<Step>,
    pub(super) events: Vec<EventRecord>,
    pub(super) tool_calls: Vec<ToolCall>,
}

impl RunRecord {
    pub(super) fn new(run: Run) -> Self {
        Self {
            run,
            steps: Vec::new(),
            events: Vec::new(),
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Default)]
pub(super) struct Inner {
    pub(super) runs: HashMap<RunId, RunRecord>,
    pub(super) links: Vec<SubrunLink>,
}

/// In-memory event store. Cheap to clone handles via `Arc` at the engine
/// level; the store itself is plain data behind one mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against a staging transaction and applies the staged changes
    /// atomically if it returns `Ok`. On `Err` the staging area is dropped
    /// and nothing is persisted.
    ///
    /// The returned [`Committed`] carries the events that gained sequence
    /// numbers in this commit and the final rows of every mutated run;
    /// broadcasting happens from it, after the lock is released.
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&mut StoreTxn<'_>) -> Result<T, EngineError>,
    ) -> Result<(T, Committed), EngineError> {
        let mut guard = self.lock();
        let mut txn = StoreTxn::new(&guard);
        let out = f(&mut txn)?;
        let staging = txn.into_staging();
        let committed = staging.apply(&mut guard)?;
        Ok((out, committed))
    }

    /// Returns the current row for a run.
    pub fn get_run(&self, id: &RunId) -> Result<Run, StoreError> {
        let guard = self.lock();
        guard
            .runs
            .get(id)
            .map(|rec| rec.run.clone())
            .ok_or(StoreError::RunNotFound(*id))
    }

    /// Returns all events with `seq > since_seq`, in order.
    pub fn read_since(&self, id: &RunId, since_seq: u64) -> Result<Vec<EventRecord>, StoreError> {
        let guard = self.lock();
        let rec = guard.runs.get(id).ok_or(StoreError::RunNotFound(*id))?;
        Ok(rec
            .events
            .iter()
            .filter(|e| e.seq > since_seq)
            .cloned()
            .collect())
    }

    /// Returns the full step ledger of a run, in order.
    pub fn steps(&self, id: &RunId) -> Result<Vec<Step>, StoreError> {
        let guard = self.lock();
        let rec = guard.runs.get(id).ok_or(StoreError::RunNotFound(*id))?;
        Ok(rec.steps.clone())
    }

    /// Returns all tool calls recorded for a run.
    pub fn tool_calls(&self, id: &RunId) -> Result<Vec<ToolCall>, StoreError> {
        let guard = self.lock();
        let rec = guard.runs.get(id).ok_or(StoreError::RunNotFound(*id))?;
        Ok(rec.tool_calls.clone())
    }

    /// Returns the child runs of a parent.
    pub fn children_of(&self, parent: &RunId) -> Vec<Run> {
        let guard = self.lock();
        guard
            .runs
            .values()
            .map(|rec| &rec.run)
            .filter(|run| run.parent_run_id.as_ref() == Some(parent))
            .cloned()
            .collect()
    }

    /// Returns the link binding a child to its parent, if any.
    pub fn link_for_child(&self, child: &RunId) -> Option<SubrunLink> {
        let guard = self.lock();
        guard
            .links
            .iter()
            .find(|l| l.child_run_id == *child)
            .cloned()
    }

    /// Returns all links of one spawn group.
    pub fn group_links(&self, parent: &RunId, group: &GroupId) -> Vec<SubrunLink> {
        let guard = self.lock();
        guard
            .links
            .iter()
            .filter(|l| l.parent_run_id == *parent && l.group_id == *group)
            .cloned()
            .collect()
    }

    /// Ids of runs currently parked in `WaitingForSubrun`, for the
    /// reconciliation sweep.
    pub fn waiting_parents(&self) -> Vec<RunId> {
        let guard = self.lock();
        guard
            .runs
            .values()
            .map(|rec| &rec.run)
            .filter(|run| run.status == RunStatus::WaitingForSubrun)
            .map(|run| run.id)
            .collect()
    }

    /// Counts active (non-terminal) runs in a workspace, split into
    /// `(parents, total)`.
    pub fn active_counts(&self, workspace: &crate::model::WorkspaceId) -> (u32, u32) {
        let guard = self.lock();
        let mut parents = 0u32;
        let mut total = 0u32;
        for run in guard.runs.values().map(|rec| &rec.run) {
            if run.workspace_id != *workspace || run.status.is_terminal() {
                continue;
            }
            total += 1;
            if run.is_parent() {
                parents += 1;
            }
        }
        (parents, total)
    }

    /// Counts non-terminal children of a parent.
    pub fn active_children_count(&self, parent: &RunId) -> u32 {
        let guard = self.lock();
        guard
            .runs
            .values()
            .map(|rec| &rec.run)
            .filter(|run| run.parent_run_id.as_ref() == Some(parent) && !run.status.is_terminal())
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StepKind, Topic, WorkspaceId, names};
    use serde_json::json;

    fn seed_run(store: &MemoryStore) -> Run {
        let run = Run::new(WorkspaceId::new(), "hello", 80);
        let (row, committed) = store
            .transact(|txn| {
                txn.create_run(run.clone())?;
                txn.run(&run.id).cloned()
            })
            .expect("create");
        assert!(committed.events.is_empty());
        assert_eq!(committed.runs.len(), 1);
        row
    }

    #[test]
    fn test_create_bumps_cursor_once() {
        let store = MemoryStore::new();
        let run = seed_run(&store);
        assert_eq!(store.get_run(&run.id).expect("row").cursor, 1);
    }

    #[test]
    fn test_seq_is_gapless_and_one_based() {
        let store = MemoryStore::new();
        let run = seed_run(&store);

        for i in 0..3 {
            let (_, committed) = store
                .transact(|txn| {
                    txn.push_event(
                        &run.id,
                        names::STEPS_APPENDED,
                        Topic::Run,
                        json!({ "i": i }),
                    )
                })
                .expect("commit");
            assert_eq!(committed.events.len(), 1);
            assert_eq!(committed.events[0].seq, i + 1);
        }

        let all = store.read_since(&run.id, 0).expect("read");
        assert_eq!(
            all.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let tail = store.read_since(&run.id, 2).expect("read");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 3);
    }

    #[test]
    fn test_failed_transaction_persists_nothing() {
        let store = MemoryStore::new();
        let run = seed_run(&store);

        let err = store
            .transact(|txn| -> Result<(), EngineError> {
                txn.append_step(&run.id, StepKind::Message, json!({"text": "x"}))?;
                txn.push_event(&run.id, names::STATE_CHANGED, Topic::Run, json!({}))?;
                Err(EngineError::Store(StoreError::Unavailable))
            })
            .expect_err("must fail");
        assert_eq!(err.as_label(), "store_unavailable");

        assert_eq!(store.get_run(&run.id).expect("row").cursor, 1);
        assert!(store.read_since(&run.id, 0).expect("read").is_empty());
        assert!(store.steps(&run.id).expect("steps").is_empty());
    }

    #[test]
    fn test_step_indices_are_monotonic() {
        let store = MemoryStore::new();
        let run = seed_run(&store);

        let (indices, _) = store
            .transact(|txn| {
                let a = txn.append_step(&run.id, StepKind::ModelCall, json!({}))?;
                let b = txn.append_step(&run.id, StepKind::ToolCall, json!({}))?;
                Ok((a, b))
            })
            .expect("commit");
        assert_eq!(indices, (1, 2));

        let (c, _) = store
            .transact(|txn| txn.append_step(&run.id, StepKind::Observation, json!({})))
            .expect("commit");
        assert_eq!(c, 3);
        assert_eq!(store.get_run(&run.id).expect("row").step_count, 3);
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let store = MemoryStore::new();
        let missing = RunId::new();
        assert!(matches!(
            store.get_run(&missing),
            Err(StoreError::RunNotFound(_))
        ));
        let err = store
            .transact(|txn| txn.run(&missing).cloned())
            .expect_err("must fail");
        assert_eq!(err.as_label(), "store_run_not_found");
    }
}
