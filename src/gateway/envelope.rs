//! Push message envelope.

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::model::{EventRecord, RunId, Topic, WorkspaceId};

/// One message on the push bus. The wire shape is stable: `type` is always
/// `"push"`, `topic` is the scope kind (`run`, `workspace`, `approvals`),
/// `channel` is the concrete instance within it (`run.<id>`, ...), and
/// `data` is the event payload verbatim.
#[derive(Clone, Debug, Serialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub topic: &'static str,
    pub channel: String,
    pub event: String,
    pub seq: u64,
    pub run_id: RunId,
    pub workspace_id: WorkspaceId,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub data: Value,
}

impl PushMessage {
    fn for_channel(record: &EventRecord, topic: Topic, channel: String) -> Self {
        Self {
            kind: "push",
            topic: topic.as_str(),
            channel,
            event: record.name.clone(),
            seq: record.seq,
            run_id: record.run_id,
            workspace_id: record.workspace_id,
            ts: record.at,
            data: record.payload.clone(),
        }
    }

    /// All messages one committed event expands into: the run channel
    /// always, plus a wider channel when the event's topic asks for one.
    pub fn fan_out(record: &EventRecord) -> Vec<PushMessage> {
        let mut out = vec![Self::for_channel(
            record,
            Topic::Run,
            format!("run.{}", record.run_id),
        )];
        match record.topic {
            Topic::Run => {}
            Topic::Workspace => out.push(Self::for_channel(
                record,
                Topic::Workspace,
                format!("workspace.{}", record.workspace_id),
            )),
            Topic::Approvals => out.push(Self::for_channel(
                record,
                Topic::Approvals,
                format!("approvals.{}", record.workspace_id),
            )),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CorrelationId, names};
    use serde_json::json;

    fn record(topic: Topic) -> EventRecord {
        EventRecord {
            run_id: RunId::new(),
            workspace_id: WorkspaceId::new(),
            seq: 7,
            name: names::STATE_CHANGED.to_string(),
            topic,
            payload: json!({"from": "PENDING", "to": "RUNNING"}),
            correlation_id: CorrelationId::new(),
            at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_run_topic_targets_only_run_channel() {
        let rec = record(Topic::Run);
        let msgs = PushMessage::fan_out(&rec);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].topic, "run");
        assert_eq!(msgs[0].channel, format!("run.{}", rec.run_id));
        assert_eq!(msgs[0].seq, 7);
        assert_eq!(msgs[0].kind, "push");
    }

    #[test]
    fn test_approvals_topic_adds_workspace_scoped_channel() {
        let rec = record(Topic::Approvals);
        let msgs = PushMessage::fan_out(&rec);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].topic, "run");
        assert_eq!(msgs[1].topic, "approvals");
        assert_eq!(msgs[1].channel, format!("approvals.{}", rec.workspace_id));
    }

    #[test]
    fn test_wire_shape_names_both_topic_and_channel() {
        let rec = record(Topic::Workspace);
        let msgs = PushMessage::fan_out(&rec);
        let wire = serde_json::to_value(&msgs[1]).expect("serialize");
        assert_eq!(wire["type"], "push");
        assert_eq!(wire["topic"], "workspace");
        assert_eq!(wire["channel"], format!("workspace.{}", rec.workspace_id));
        assert_eq!(wire["data"], rec.payload);
    }
}
