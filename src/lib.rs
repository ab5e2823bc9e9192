//! # runplane: a control plane for long-lived agent runs.
//!
//! Drives many concurrent run state machines: each run advances through
//! discrete ticks (consult a model, execute tools, spawn sub-runs) while
//! every mutation is committed as an append-only event stream that clients
//! can replay after a disconnect.
//!
//! ## Architecture
//! ```text
//! commands ──► Engine ──► store txn ──► Committed ──► Bus ──► subscribers
//!                │                          │
//!                │                          └─► follow-up ticks / cascades
//!                ▼
//!          worker pool ◄── tick queue ◄── reaper / reconcile sweeps
//!                │
//!                └── lease per run ── model / tool calls (outside the lock)
//! ```
//!
//! - [`store`] — transactional in-memory event store; per-run gapless `seq`
//! - [`lease`] — at-most-one active tick per run, TTL-based crash recovery
//! - [`engine`] — tick execution, status machine, command surface
//! - [`subruns`] — fan-out/join coordination with failure policies
//! - [`quota`] — admission ceilings and per-workspace rate limits
//! - [`gateway`] — fire-and-forget push fan-out over topic channels
//! - [`snapshot`] — full-state snapshots and event replay
//!
//! ## Quick start
//! ```rust,no_run
//! use std::sync::Arc;
//! use runplane::{EngineBuilder, EngineConfig, LogWriter};
//! # use runplane::{Directive, ModelClient, ToolExecutor, ExternalCallError, Run, Step};
//! # use tokio_util::sync::CancellationToken;
//! # struct Scripted;
//! # #[async_trait::async_trait]
//! # impl ModelClient for Scripted {
//! #     async fn consult(&self, _: &Run, _: &[Step], _: CancellationToken)
//! #         -> Result<Directive, ExternalCallError> { Ok(Directive::Message("done".into())) }
//! # }
//! # struct NoTools;
//! # #[async_trait::async_trait]
//! # impl ToolExecutor for NoTools {
//! #     async fn execute(&self, _: &str, _: &serde_json::Value, _: CancellationToken)
//! #         -> Result<serde_json::Value, ExternalCallError> { Ok(serde_json::Value::Null) }
//! # }
//!
//! # async fn demo() -> Result<(), runplane::EngineError> {
//! let engine = EngineBuilder::new(
//!     EngineConfig::default(),
//!     Arc::new(Scripted),
//!     Arc::new(NoTools),
//! )
//! .with_subscribers(vec![Arc::new(LogWriter)])
//! .build();
//! engine.start();
//!
//! let run = engine.create_run(runplane::WorkspaceId::new(), "summarize the report")?;
//! let _events = engine.replay(run.id, Some(0))?;
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod gateway;
pub mod lease;
pub mod model;
pub mod policies;
pub mod quota;
pub mod snapshot;
pub mod store;
pub mod subruns;

pub use config::{EngineConfig, QuotaLimits};
pub use engine::{Engine, EngineBuilder, TickRequest};
pub use error::{EngineError, ExternalCallError, StoreError, TickOutcome};
pub use exec::{ChildSpec, Directive, ModelClient, ModelRef, ToolExecutor, ToolsRef};
pub use gateway::{Bus, LogWriter, PushMessage, Subscribe, SubscriberSet};
pub use lease::{Lease, LeaseManager};
pub use model::{
    CorrelationId, EventRecord, FailurePolicy, GroupId, JoinPolicy, LinkResolution, RiskLevel, Run,
    RunId, RunStatus, Step, StepKind, SubrunLink, ToolCall, ToolCallStatus, Topic, WorkspaceId,
    names,
};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use quota::{QuotaGovernor, RateKind};
pub use snapshot::{ChildSummary, ReplayResponse, RunProjection, RunSnapshot};
pub use store::{Committed, MemoryStore, StoreTxn};
pub use subruns::{GroupVerdict, evaluate_group};
