//! Tool-call envelopes: the request/response record for one external tool
//! invocation, including its approval gate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{CorrelationId, RunId};

/// Risk tier of a tool. Elevated and dangerous tools require approval by
/// default; the model directive may override per call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Elevated,
    Dangerous,
}

impl RiskLevel {
    /// Default approval requirement for this tier.
    pub fn requires_approval(&self) -> bool {
        matches!(self, RiskLevel::Elevated | RiskLevel::Dangerous)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Elevated => "ELEVATED",
            RiskLevel::Dangerous => "DANGEROUS",
        }
    }
}

/// Lifecycle of a tool call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCallStatus {
    /// Cleared to execute; the next tick picks it up.
    Pending,
    /// Parked until an approval or rejection command arrives.
    WaitingForApproval,
    /// Claimed by a tick and executing. A claim orphaned by a reclaimed
    /// lease is re-executed, so executors must tolerate a retry.
    Running,
    Completed,
    Failed,
    /// Closed without a result because the run was cancelled.
    Canceled,
}

/// One tool invocation, keyed by `(run_id, step_index)` of its TOOL_CALL step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub run_id: RunId,
    pub step_index: u64,
    pub tool_name: String,
    pub args: Value,
    pub risk: RiskLevel,
    pub requires_approval: bool,
    pub status: ToolCallStatus,
    pub result: Value,
    pub correlation_id: CorrelationId,
}
