//! # Snapshots and replay.
//!
//! Reconnecting clients resynchronize one of two ways:
//! - `since_seq` given → the tail of the event log (`seq > since_seq`),
//! - no `since_seq` → a full [`RunSnapshot`] of current state.
//!
//! Both converge: folding the replayed events over an empty
//! [`RunProjection`] yields the same status and step ledger the snapshot
//! reports, because every event payload carries `to` and the steps it
//! folded in.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    EventRecord, FailurePolicy, GroupId, JoinPolicy, LinkResolution, Run, RunId, RunStatus, Step,
    ToolCall, names,
};

/// Point-in-time view of one run: its row, the full step ledger, the full
/// event log, its tool calls, and a summary row per child.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub steps: Vec<Step>,
    pub events: Vec<EventRecord>,
    pub tool_calls: Vec<ToolCall>,
    pub children: Vec<ChildSummary>,
}

/// One child of a run, as seen from the parent's snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub group_id: GroupId,
    pub join_policy: JoinPolicy,
    pub failure_policy: FailurePolicy,
    pub resolution: LinkResolution,
}

/// Answer to a replay request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplayResponse {
    /// Tail of the event log past the client's `since_seq`.
    Events { events: Vec<EventRecord> },
    /// Full state, for clients with no resume point.
    Snapshot { snapshot: RunSnapshot },
}

/// Client-side fold of an event stream back into run state. Events with
/// unknown names are skipped rather than rejected, so older clients survive
/// newer logs.
#[derive(Clone, Debug, Default)]
pub struct RunProjection {
    pub status: Option<RunStatus>,
    pub steps: Vec<Value>,
    pub last_seq: u64,
}

impl RunProjection {
    /// Folds one event. Out-of-order or duplicate sequence numbers are
    /// ignored; the stream is per-run ordered at the source.
    pub fn apply(&mut self, event: &EventRecord) {
        if event.seq <= self.last_seq {
            return;
        }
        self.last_seq = event.seq;
        if let Some(steps) = event.payload.get("steps").and_then(Value::as_array) {
            self.steps.extend(steps.iter().cloned());
        }
        if event.name == names::SUBRUN_COMPLETED || event.name == names::SUBRUN_CANCELLED {
            return;
        }
        if let Some(to) = event.payload.get("to") {
            if let Ok(status) = serde_json::from_value::<RunStatus>(to.clone()) {
                self.status = Some(status);
            }
        }
    }

    /// Folds a whole (ordered) event slice.
    pub fn from_events(events: &[EventRecord]) -> Self {
        let mut projection = Self::default();
        for event in events {
            projection.apply(event);
        }
        projection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CorrelationId, Topic, WorkspaceId};
    use serde_json::json;
    use time::OffsetDateTime;

    fn event(seq: u64, name: &str, payload: Value) -> EventRecord {
        EventRecord {
            run_id: RunId::new(),
            workspace_id: WorkspaceId::new(),
            seq,
            name: name.to_string(),
            topic: Topic::Run,
            payload,
            correlation_id: CorrelationId::new(),
            at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_projection_folds_status_and_steps() {
        let events = vec![
            event(
                1,
                names::STATE_CHANGED,
                json!({"from": "PENDING", "to": "RUNNING", "steps": [{"index": 1}]}),
            ),
            event(2, names::STEPS_APPENDED, json!({"steps": [{"index": 2}]})),
            event(
                3,
                names::STATE_CHANGED,
                json!({"from": "RUNNING", "to": "COMPLETED", "steps": [{"index": 3}]}),
            ),
        ];
        let projection = RunProjection::from_events(&events);
        assert_eq!(projection.status, Some(RunStatus::Completed));
        assert_eq!(projection.steps.len(), 3);
        assert_eq!(projection.last_seq, 3);
    }

    #[test]
    fn test_projection_ignores_duplicates_and_unknown_names() {
        let mut projection = RunProjection::default();
        projection.apply(&event(
            1,
            names::STATE_CHANGED,
            json!({"from": "PENDING", "to": "RUNNING", "steps": []}),
        ));
        // Replayed duplicate.
        projection.apply(&event(
            1,
            names::STATE_CHANGED,
            json!({"from": "RUNNING", "to": "FAILED", "steps": []}),
        ));
        projection.apply(&event(2, "something_newer", json!({"whatever": true})));
        assert_eq!(projection.status, Some(RunStatus::Running));
        assert_eq!(projection.last_seq, 2);
    }

    #[test]
    fn test_child_notifications_do_not_touch_parent_status() {
        let mut projection = RunProjection::default();
        projection.apply(&event(
            1,
            names::STATE_CHANGED,
            json!({"from": "PENDING", "to": "RUNNING", "steps": []}),
        ));
        projection.apply(&event(
            2,
            names::SUBRUN_COMPLETED,
            json!({"child": RunId::new(), "status": "COMPLETED"}),
        ));
        assert_eq!(projection.status, Some(RunStatus::Running));
    }
}
