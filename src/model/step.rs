//! Step records: the ordered ledger of work performed inside a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::ids::{CorrelationId, RunId};

/// Kind of work a step records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// Consultation of the model for the next directive.
    ModelCall,
    /// A tool invocation request.
    ToolCall,
    /// The result (or failure) of a tool invocation.
    Observation,
    /// A final message produced by the run.
    Message,
    /// Record of a child run being spawned.
    SubrunSpawn,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ModelCall => "MODEL_CALL",
            StepKind::ToolCall => "TOOL_CALL",
            StepKind::Observation => "OBSERVATION",
            StepKind::Message => "MESSAGE",
            StepKind::SubrunSpawn => "SUBRUN_SPAWN",
        }
    }
}

/// One ordered step of a run. `step_index` is strictly monotonic and unique
/// per run; the store allocates it at commit, never the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub run_id: RunId,
    pub step_index: u64,
    pub kind: StepKind,
    pub payload: Value,
    pub correlation_id: CorrelationId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
