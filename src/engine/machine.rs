//! # Transition helpers: the only place run status changes.
//!
//! Every status change goes through [`transition`]: it validates the edge
//! against [`RunStatus::can_transition_to`], stamps `started_at`/`ended_at`,
//! folds the steps staged since the previous event into the event payload,
//! and appends exactly one event. Ticks that append steps without changing
//! status close them with [`flush_steps`] instead.
//!
//! ## Rules
//! - One event per transition; step appends never emit their own event.
//! - The event payload always carries `from`, `to`, and `steps` (possibly
//!   empty) so an empty projection can be folded back to live state.
//! - [`retry_transition`] is the single deliberate exception to the edge
//!   table: it re-opens a `Failed` run on an explicit operator command.

use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::error::EngineError;
use crate::model::{RunId, RunStatus, Step, Topic, names};
use crate::store::StoreTxn;

/// Summarizes staged steps for an event payload.
fn step_summaries(steps: &[Step]) -> Vec<Value> {
    steps
        .iter()
        .map(|s| {
            json!({
                "index": s.step_index,
                "kind": s.kind.as_str(),
                "payload": s.payload,
            })
        })
        .collect()
}

/// Which broadcast scope an event name belongs to.
fn topic_for(name: &str) -> Topic {
    match name {
        names::TOOL_CALL_REQUESTED | names::TOOL_CALL_APPROVED | names::TOOL_CALL_REJECTED => {
            Topic::Approvals
        }
        names::RUN_CANCELLED | names::RUN_FAILED | names::SUBRUN_SPAWNED => Topic::Workspace,
        _ => Topic::Run,
    }
}

fn merge_extra(mut payload: Value, extra: Value) -> Value {
    if let (Some(map), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
    }
    payload
}

/// Moves a run to `to`, emitting one `event_name` event that folds in the
/// steps staged since the previous event plus `extra` payload fields.
pub fn transition(
    txn: &mut StoreTxn<'_>,
    id: &RunId,
    to: RunStatus,
    event_name: &str,
    extra: Value,
) -> Result<(), EngineError> {
    let mut run = txn.run(id)?.clone();
    let from = run.status;
    if !from.can_transition_to(to) {
        return Err(EngineError::IllegalTransition { from, to });
    }
    run.status = to;
    let now = OffsetDateTime::now_utc();
    if to == RunStatus::Running && run.started_at.is_none() {
        run.started_at = Some(now);
    }
    if to.is_terminal() {
        run.ended_at = Some(now);
    }
    txn.put_run(run)?;

    let steps = txn.take_unflushed(id);
    let payload = merge_extra(
        json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "steps": step_summaries(&steps),
        }),
        extra,
    );
    txn.push_event(id, event_name, topic_for(event_name), payload)
}

/// Emits a `steps_appended` event for a tick that staged steps without a
/// status change. No-op when nothing is staged.
pub fn flush_steps(txn: &mut StoreTxn<'_>, id: &RunId) -> Result<bool, EngineError> {
    let steps = txn.take_unflushed(id);
    if steps.is_empty() {
        return Ok(false);
    }
    txn.push_event(
        id,
        names::STEPS_APPENDED,
        Topic::Run,
        json!({ "steps": step_summaries(&steps) }),
    )?;
    Ok(true)
}

/// Re-opens a `Failed` run as `Running` on an explicit retry command. The
/// only transition allowed out of a terminal state.
pub fn retry_transition(txn: &mut StoreTxn<'_>, id: &RunId) -> Result<(), EngineError> {
    let mut run = txn.run(id)?.clone();
    if run.status != RunStatus::Failed {
        return Err(EngineError::InvalidCommand {
            reason: format!("retry requires a failed run, got {}", run.status.as_str()),
        });
    }
    let from = run.status;
    run.status = RunStatus::Running;
    run.error_summary.clear();
    run.ended_at = None;
    run.cancel_requested = false;
    txn.put_run(run)?;
    txn.push_event(
        id,
        names::STATE_CHANGED,
        Topic::Run,
        json!({
            "from": from.as_str(),
            "to": RunStatus::Running.as_str(),
            "steps": [],
            "retry": true,
        }),
    )
}
