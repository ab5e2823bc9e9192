//! # Sub-run links: the join/failure contract between a parent and a child.
//!
//! A [`SubrunLink`] is created at spawn time, one per child, all children of a
//! batch sharing a `group_id`. Links are durable rows keyed by
//! `(parent, group)` — never in-memory object references — so reconciliation
//! sweeps can evaluate them after a crash. A link is mutated only by the
//! sub-run coordinator and becomes immutable once resolved.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ids::{GroupId, RunId};

/// Rule deciding when a parent resumes based on child outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinPolicy {
    /// Satisfied on the first successful child.
    Any,
    /// Satisfied only when every child is terminal and successful.
    All,
    /// Satisfied once `n` children succeed, regardless of the rest.
    Quorum { n: u32 },
    /// Satisfied once the deadline elapses (measured from the earliest link
    /// in the group), independent of child outcomes.
    Timeout { deadline: Duration },
}

impl JoinPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinPolicy::Any => "ANY",
            JoinPolicy::All => "ALL",
            JoinPolicy::Quorum { .. } => "QUORUM",
            JoinPolicy::Timeout { .. } => "TIMEOUT",
        }
    }

    /// Quorum target, if this is a quorum policy.
    pub fn quorum(&self) -> Option<u32> {
        match self {
            JoinPolicy::Quorum { n } => Some(*n),
            _ => None,
        }
    }

    /// Deadline, if this is a timeout policy.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            JoinPolicy::Timeout { deadline } => Some(*deadline),
            _ => None,
        }
    }
}

/// Rule deciding whether a child failure propagates to the parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    /// A failed or cancelled child fails the parent immediately.
    FailFast,
    /// Child failures count as terminal outcomes; join evaluation continues.
    Tolerate,
    /// Like `FailFast`, but running siblings are cancelled first.
    CancelSiblings,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailFast => "FAIL_FAST",
            FailurePolicy::Tolerate => "TOLERATE",
            FailurePolicy::CancelSiblings => "CANCEL_SIBLINGS",
        }
    }
}

/// Resolution state of a link's group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkResolution {
    Pending,
    Satisfied,
    Failed,
    TimedOut,
}

impl LinkResolution {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, LinkResolution::Pending)
    }
}

/// Durable parent→child contract. `child_run_id` is unique: a child belongs
/// to exactly one link.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubrunLink {
    pub parent_run_id: RunId,
    pub child_run_id: RunId,
    pub group_id: GroupId,
    pub join_policy: JoinPolicy,
    pub failure_policy: FailurePolicy,
    pub resolution: LinkResolution,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SubrunLink {
    pub fn new(
        parent_run_id: RunId,
        child_run_id: RunId,
        group_id: GroupId,
        join_policy: JoinPolicy,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            parent_run_id,
            child_run_id,
            group_id,
            join_policy,
            failure_policy,
            resolution: LinkResolution::Pending,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}
