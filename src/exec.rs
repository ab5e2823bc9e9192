//! # External execution seams: model consultation and tool invocation.
//!
//! The engine never calls the outside world directly. It consults a
//! [`ModelClient`] for the next [`Directive`] and executes tool calls through
//! a [`ToolExecutor`]. Both are async and cancelable: implementations receive
//! a [`CancellationToken`] and should exit promptly when it fires (run
//! cancellation or engine shutdown).
//!
//! ## Rules
//! - External calls run OUTSIDE store transactions: the tick holds the run's
//!   lease, not the store lock, while awaiting them.
//! - A call failure never panics the worker; it is folded back into the run
//!   as an observation or a terminal transition.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ExternalCallError;
use crate::model::{FailurePolicy, JoinPolicy, RiskLevel, Run, Step};

/// What one tick should do next, as decided by the model.
#[derive(Clone, Debug)]
pub enum Directive {
    /// Invoke a tool. `requires_approval` overrides the risk-tier default
    /// when set.
    CallTool {
        name: String,
        args: Value,
        risk: RiskLevel,
        requires_approval: Option<bool>,
    },
    /// Spawn child runs and park until the join policy resolves.
    Spawn {
        specs: Vec<ChildSpec>,
        join: JoinPolicy,
        failure: FailurePolicy,
    },
    /// Produce a final message and complete the run.
    Message(String),
}

/// Input for one child run of a spawn directive.
#[derive(Clone, Debug)]
pub struct ChildSpec {
    pub input_text: String,
}

/// Shared handle to a model client.
pub type ModelRef = Arc<dyn ModelClient>;

/// Shared handle to a tool executor.
pub type ToolsRef = Arc<dyn ToolExecutor>;

/// # Decides the next directive for a run.
///
/// `consult` sees the run row and its step ledger so far. Implementations
/// should check `ctx.is_cancelled()` and exit quickly during shutdown.
#[async_trait]
pub trait ModelClient: Send + Sync + 'static {
    async fn consult(
        &self,
        run: &Run,
        steps: &[Step],
        ctx: CancellationToken,
    ) -> Result<Directive, ExternalCallError>;
}

/// # Executes one tool invocation.
///
/// The returned value becomes the observation payload recorded against the
/// run. Implementations should check `ctx.is_cancelled()` and exit quickly.
#[async_trait]
pub trait ToolExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        name: &str,
        args: &Value,
        ctx: CancellationToken,
    ) -> Result<Value, ExternalCallError>;
}
