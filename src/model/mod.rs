//! Domain model: runs, steps, events, tool calls, and sub-run links.

mod event;
mod ids;
mod link;
mod run;
mod step;
mod tool;

pub use event::{EventRecord, Topic, names};
pub use ids::{CorrelationId, GroupId, RunId, WorkspaceId};
pub use link::{FailurePolicy, JoinPolicy, LinkResolution, SubrunLink};
pub use run::{Run, RunStatus};
pub use step::{Step, StepKind};
pub use tool::{RiskLevel, ToolCall, ToolCallStatus};
