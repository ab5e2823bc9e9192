//! Transaction staging area.
//!
//! A [`StoreTxn`] is a copy-on-touch overlay over the store's locked state:
//! the first read of a run clones its record into staging, and all writes
//! hit the staged copy. Nothing is visible to other readers until
//! [`Staging::apply`] writes the staged records back, which only happens
//! when the transaction closure returned `Ok`.

use std::collections::HashMap;

use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{EngineError, StoreError};
use crate::model::{
    EventRecord, GroupId, LinkResolution, Run, RunId, Step, StepKind, SubrunLink, ToolCall,
    ToolCallStatus, Topic,
};

use super::memory::{Inner, RunRecord};

/// Result of a successful commit: the events that gained sequence numbers
/// and the final rows of every mutated run, in staging order.
#[derive(Debug, Default)]
pub struct Committed {
    pub events: Vec<EventRecord>,
    pub runs: Vec<Run>,
}

struct StagedRun {
    rec: RunRecord,
    /// Events already committed before this txn; anything past this index
    /// is new and gets its `seq` at apply time.
    base_events: usize,
    /// Steps staged this txn but not yet folded into an event payload.
    unflushed: Vec<Step>,
    is_new: bool,
    dirty: bool,
}

/// Staging handle passed to transaction closures.
pub struct StoreTxn<'a> {
    base: &'a Inner,
    staged: HashMap<RunId, StagedRun>,
    order: Vec<RunId>,
    new_links: Vec<SubrunLink>,
    resolutions: Vec<(RunId, LinkResolution)>,
}

impl<'a> StoreTxn<'a> {
    pub(super) fn new(base: &'a Inner) -> Self {
        Self {
            base,
            staged: HashMap::new(),
            order: Vec::new(),
            new_links: Vec::new(),
            resolutions: Vec::new(),
        }
    }

    fn touch(&mut self, id: &RunId) -> Result<&mut StagedRun, EngineError> {
        if !self.staged.contains_key(id) {
            let rec = self
                .base
                .runs
                .get(id)
                .cloned()
                .ok_or(StoreError::RunNotFound(*id))?;
            let base_events = rec.events.len();
            self.staged.insert(
                *id,
                StagedRun {
                    rec,
                    base_events,
                    unflushed: Vec::new(),
                    is_new: false,
                    dirty: false,
                },
            );
            self.order.push(*id);
        }
        // Just inserted above when missing.
        self.staged
            .get_mut(id)
            .ok_or_else(|| StoreError::RunNotFound(*id).into())
    }

    /// Current row of a run (staged view).
    pub fn run(&mut self, id: &RunId) -> Result<&Run, EngineError> {
        Ok(&self.touch(id)?.rec.run)
    }

    /// Replaces a run row. The caller clones via [`StoreTxn::run`], mutates,
    /// and puts the row back.
    pub fn put_run(&mut self, run: Run) -> Result<(), EngineError> {
        let id = run.id;
        let staged = self.touch(&id)?;
        staged.rec.run = run;
        staged.dirty = true;
        Ok(())
    }

    /// Stages a brand-new run row.
    pub fn create_run(&mut self, run: Run) -> Result<(), EngineError> {
        let id = run.id;
        if self.base.runs.contains_key(&id) || self.staged.contains_key(&id) {
            return Err(EngineError::InvalidCommand {
                reason: format!("run {id} already exists"),
            });
        }
        self.staged.insert(
            id,
            StagedRun {
                rec: RunRecord::new(run),
                base_events: 0,
                unflushed: Vec::new(),
                is_new: true,
                dirty: true,
            },
        );
        self.order.push(id);
        Ok(())
    }

    /// Appends a step and returns its index (1-based, monotonic per run).
    pub fn append_step(
        &mut self,
        id: &RunId,
        kind: StepKind,
        payload: Value,
    ) -> Result<u64, EngineError> {
        let staged = self.touch(id)?;
        staged.rec.run.step_count += 1;
        let step = Step {
            run_id: *id,
            step_index: staged.rec.run.step_count,
            kind,
            payload,
            correlation_id: staged.rec.run.correlation_id,
            created_at: OffsetDateTime::now_utc(),
        };
        staged.rec.steps.push(step.clone());
        staged.unflushed.push(step.clone());
        staged.dirty = true;
        Ok(step.step_index)
    }

    /// Drains the steps appended this transaction that have not yet been
    /// folded into an event payload.
    pub fn take_unflushed(&mut self, id: &RunId) -> Vec<Step> {
        self.staged
            .get_mut(id)
            .map(|s| std::mem::take(&mut s.unflushed))
            .unwrap_or_default()
    }

    /// Stages an event append. The sequence number is assigned at apply
    /// time; the staged record carries `seq = 0` until then.
    pub fn push_event(
        &mut self,
        id: &RunId,
        name: &str,
        topic: Topic,
        payload: Value,
    ) -> Result<(), EngineError> {
        let staged = self.touch(id)?;
        let run = &staged.rec.run;
        staged.rec.events.push(EventRecord {
            run_id: *id,
            workspace_id: run.workspace_id,
            seq: 0,
            name: name.to_string(),
            topic,
            payload,
            correlation_id: run.correlation_id,
            at: OffsetDateTime::now_utc(),
        });
        staged.dirty = true;
        Ok(())
    }

    /// Stages a tool call row.
    pub fn insert_tool_call(&mut self, call: ToolCall) -> Result<(), EngineError> {
        let staged = self.touch(&call.run_id)?;
        staged.rec.tool_calls.push(call);
        staged.dirty = true;
        Ok(())
    }

    /// Updates the status (and optionally result) of a tool call.
    pub fn update_tool_call(
        &mut self,
        id: &RunId,
        step_index: u64,
        status: ToolCallStatus,
        result: Option<Value>,
    ) -> Result<(), EngineError> {
        let staged = self.touch(id)?;
        let call = staged
            .rec
            .tool_calls
            .iter_mut()
            .find(|c| c.step_index == step_index)
            .ok_or_else(|| EngineError::InvalidCommand {
                reason: format!("no tool call at step {step_index} of run {id}"),
            })?;
        call.status = status;
        if let Some(result) = result {
            call.result = result;
        }
        staged.dirty = true;
        Ok(())
    }

    /// Latest tool call of a run with the given status.
    pub fn latest_tool_call(
        &mut self,
        id: &RunId,
        status: ToolCallStatus,
    ) -> Result<Option<ToolCall>, EngineError> {
        let staged = self.touch(id)?;
        Ok(staged
            .rec
            .tool_calls
            .iter()
            .rev()
            .find(|c| c.status == status)
            .cloned())
    }

    /// Stages a parent→child link.
    pub fn insert_link(&mut self, link: SubrunLink) {
        self.new_links.push(link);
    }

    /// Stages a link resolution (staged view returns the updated value).
    pub fn resolve_link(&mut self, child: &RunId, resolution: LinkResolution) {
        self.resolutions.push((*child, resolution));
    }

    fn overlay_link(&self, link: &SubrunLink) -> SubrunLink {
        let mut link = link.clone();
        for (child, resolution) in &self.resolutions {
            if *child == link.child_run_id {
                link.resolution = *resolution;
            }
        }
        link
    }

    /// Link binding a child to its parent, staged view.
    pub fn link_for_child(&self, child: &RunId) -> Option<SubrunLink> {
        self.base
            .links
            .iter()
            .chain(self.new_links.iter())
            .find(|l| l.child_run_id == *child)
            .map(|l| self.overlay_link(l))
    }

    /// All links of one spawn group, staged view.
    pub fn group_links(&self, parent: &RunId, group: &GroupId) -> Vec<SubrunLink> {
        self.base
            .links
            .iter()
            .chain(self.new_links.iter())
            .filter(|l| l.parent_run_id == *parent && l.group_id == *group)
            .map(|l| self.overlay_link(l))
            .collect()
    }

    /// Links of a parent still awaiting resolution, staged view.
    pub fn pending_links(&self, parent: &RunId) -> Vec<SubrunLink> {
        self.base
            .links
            .iter()
            .chain(self.new_links.iter())
            .filter(|l| l.parent_run_id == *parent)
            .map(|l| self.overlay_link(l))
            .filter(|l| !l.resolution.is_resolved())
            .collect()
    }

    /// Child rows of a parent, staged view.
    pub fn children_of(&self, parent: &RunId) -> Vec<Run> {
        let mut out: Vec<Run> = Vec::new();
        for (id, rec) in &self.base.runs {
            if self.staged.contains_key(id) {
                continue;
            }
            if rec.run.parent_run_id.as_ref() == Some(parent) {
                out.push(rec.run.clone());
            }
        }
        for id in &self.order {
            if let Some(staged) = self.staged.get(id) {
                if staged.rec.run.parent_run_id.as_ref() == Some(parent) {
                    out.push(staged.rec.run.clone());
                }
            }
        }
        out
    }

    /// Active (non-terminal) runs in a workspace as `(parents, total)`,
    /// staged view. Used for admission checks atomic with run creation.
    pub fn active_counts(&self, workspace: &crate::model::WorkspaceId) -> (u32, u32) {
        let mut parents = 0u32;
        let mut total = 0u32;
        let base = self
            .base
            .runs
            .iter()
            .filter(|(id, _)| !self.staged.contains_key(id))
            .map(|(_, rec)| &rec.run);
        let staged = self.order.iter().filter_map(|id| self.staged.get(id)).map(|s| &s.rec.run);
        for run in base.chain(staged) {
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

    /// Non-terminal children of a parent, staged view.
    pub fn active_children_count(&self, parent: &RunId) -> u32 {
        self.children_of(parent)
            .iter()
            .filter(|run| !run.status.is_terminal())
            .count() as u32
    }

    pub(super) fn into_staging(self) -> Staging {
        Staging {
            staged: self.staged,
            order: self.order,
            new_links: self.new_links,
            resolutions: self.resolutions,
        }
    }
}

/// Owned staging data, detached from the borrow on store state so it can be
/// applied back with a mutable reference.
pub(super) struct Staging {
    staged: HashMap<RunId, StagedRun>,
    order: Vec<RunId>,
    new_links: Vec<SubrunLink>,
    resolutions: Vec<(RunId, LinkResolution)>,
}

impl Staging {
    pub(super) fn apply(mut self, inner: &mut Inner) -> Result<Committed, EngineError> {
        let mut committed = Committed::default();

        for id in &self.order {
            let Some(mut staged) = self.staged.remove(id) else {
                continue;
            };
            if !staged.dirty {
                continue;
            }

            // The global lock serialized us; a moved base is a logic bug.
            if !staged.is_new {
                let base_len = inner.runs.get(id).map(|r| r.events.len()).unwrap_or(0);
                if base_len != staged.base_events {
                    return Err(StoreError::SequenceConflict(*id).into());
                }
            }

            staged.rec.run.cursor += 1;
            for (i, event) in staged.rec.events.iter_mut().enumerate().skip(staged.base_events) {
                event.seq = (i + 1) as u64;
                committed.events.push(event.clone());
            }
            committed.runs.push(staged.rec.run.clone());
            inner.runs.insert(*id, staged.rec);
        }

        for (child, resolution) in self.resolutions.drain(..) {
            if let Some(link) = self
                .new_links
                .iter_mut()
                .chain(inner.links.iter_mut())
                .find(|l| l.child_run_id == child)
            {
                link.resolution = resolution;
            }
        }
        inner.links.extend(self.new_links.drain(..));

        Ok(committed)
    }
}
