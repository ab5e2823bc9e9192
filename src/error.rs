//! Error types used by the runplane engine and external calls.
//!
//! This module defines three error enums:
//!
//! - [`EngineError`] — failures surfaced by engine operations and commands.
//! - [`StoreError`] — failures raised inside store transactions.
//! - [`ExternalCallError`] — failures of model/tool invocations.
//!
//! All types provide `as_label` for logging, and [`ExternalCallError`]
//! additionally exposes [`ExternalCallError::is_retryable`].
//!
//! [`TickOutcome`] lives here as well: it is the non-error half of a tick's
//! result, since a stale or contended tick is an expected outcome rather
//! than a failure.

use std::time::Duration;
use thiserror::Error;

use crate::model::{RunId, RunStatus};

/// # Errors surfaced by engine operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    /// Another worker holds the run's lease.
    #[error("run is busy: lease held elsewhere")]
    Busy,

    /// Admission was refused by the quota governor.
    #[error("quota exceeded: {reason}")]
    QuotaExceeded {
        /// Which limit was hit.
        reason: String,
    },

    /// A command or tick asked for a transition the status graph forbids.
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition { from: RunStatus, to: RunStatus },

    /// The command does not apply to the run's current state.
    #[error("invalid command: {reason}")]
    InvalidCommand {
        /// Why the command was refused.
        reason: String,
    },

    /// Shutdown grace period was exceeded; some workers had to be aborted.
    #[error("shutdown timeout {grace:?} exceeded; forcing termination")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
    },

    /// A store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EngineError::Busy => "engine_busy",
            EngineError::QuotaExceeded { .. } => "engine_quota_exceeded",
            EngineError::IllegalTransition { .. } => "engine_illegal_transition",
            EngineError::InvalidCommand { .. } => "engine_invalid_command",
            EngineError::GraceExceeded { .. } => "engine_grace_exceeded",
            EngineError::Store(e) => e.as_label(),
        }
    }
}

/// # Errors raised inside store transactions.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// No run row with this id.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// The tick's expected cursor no longer matches the run row.
    #[error("stale tick: cursor moved under the caller")]
    StaleTick,

    /// An event append would reuse an existing per-run sequence number.
    #[error("sequence conflict on run {0}")]
    SequenceConflict(RunId),

    /// The store rejected the transaction for an unspecified reason.
    #[error("store unavailable")]
    Unavailable,
}

impl StoreError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::RunNotFound(_) => "store_run_not_found",
            StoreError::StaleTick => "store_stale_tick",
            StoreError::SequenceConflict(_) => "store_sequence_conflict",
            StoreError::Unavailable => "store_unavailable",
        }
    }
}

/// # Errors produced by model and tool invocations.
///
/// External calls run outside store transactions; their failures are folded
/// back into the run as observations or terminal transitions. `Timeout` and
/// `Transient` are retryable, the rest are not.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ExternalCallError {
    /// The call exceeded its timeout.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// The call was cancelled (run cancellation or shutdown).
    #[error("call cancelled")]
    Canceled,

    /// Non-recoverable failure (should not be retried).
    #[error("fatal error (no retry): {error}")]
    Fatal {
        /// The underlying error message.
        error: String,
    },

    /// The call failed but may succeed if retried.
    #[error("call failed: {error}")]
    Transient {
        /// The underlying error message.
        error: String,
    },
}

impl ExternalCallError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ExternalCallError::Timeout { .. } => "call_timeout",
            ExternalCallError::Canceled => "call_canceled",
            ExternalCallError::Fatal { .. } => "call_fatal",
            ExternalCallError::Transient { .. } => "call_transient",
        }
    }

    /// Indicates whether the error type is safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExternalCallError::Transient { .. } | ExternalCallError::Timeout { .. }
        )
    }
}

/// Result of one tick attempt. Only `Advanced` commits a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The run state advanced and the cursor was bumped.
    Advanced,
    /// The tick held the lease but found nothing to do.
    Noop,
    /// The run's cursor had already moved; the tick was a duplicate.
    Stale,
    /// The lease was held elsewhere; the tick will be retried.
    Busy,
}

impl TickOutcome {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TickOutcome::Advanced => "tick_advanced",
            TickOutcome::Noop => "tick_noop",
            TickOutcome::Stale => "tick_stale",
            TickOutcome::Busy => "tick_busy",
        }
    }
}
