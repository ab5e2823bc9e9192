//! Quota governor.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::config::QuotaLimits;
use crate::error::EngineError;
use crate::model::{RunId, WorkspaceId};

use super::bucket::TokenBucket;

/// Which rate limit a call counts against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateKind {
    RunCreation,
    Spawn,
    Snapshot,
}

impl RateKind {
    fn as_str(&self) -> &'static str {
        match self {
            RateKind::RunCreation => "run_creation",
            RateKind::Spawn => "spawn",
            RateKind::Snapshot => "snapshot",
        }
    }
}

#[derive(Default)]
struct State {
    buckets: HashMap<(WorkspaceId, RateKind), TokenBucket>,
    pending_approvals: HashSet<RunId>,
}

/// Admission control. Shared once per engine; all methods are `&self`.
pub struct QuotaGovernor {
    limits: QuotaLimits,
    state: Mutex<State>,
}

impl QuotaGovernor {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rate_of(&self, kind: RateKind) -> f64 {
        match kind {
            RateKind::RunCreation => self.limits.run_creation_per_sec,
            RateKind::Spawn => self.limits.spawn_per_sec,
            RateKind::Snapshot => self.limits.snapshot_per_sec,
        }
    }

    /// Takes one token from the `(workspace, kind)` bucket.
    pub fn allow_rate(&self, workspace: &WorkspaceId, kind: RateKind) -> Result<(), EngineError> {
        let rate = self.rate_of(kind);
        if rate <= 0.0 {
            return Ok(());
        }
        let mut state = self.lock();
        let bucket = state
            .buckets
            .entry((*workspace, kind))
            .or_insert_with(|| TokenBucket::new(rate));
        if bucket.try_take(Instant::now()) {
            Ok(())
        } else {
            Err(EngineError::QuotaExceeded {
                reason: format!("{} rate limit", kind.as_str()),
            })
        }
    }

    /// Checks active run counts against the concurrency ceilings. `is_parent`
    /// says whether the run being admitted is top-level; the counts are the
    /// pre-admission values read inside the admitting transaction.
    pub fn check_run_counts(
        &self,
        parents: u32,
        total: u32,
        is_parent: bool,
    ) -> Result<(), EngineError> {
        if self.limits.max_total_runs > 0 && total >= self.limits.max_total_runs {
            return Err(EngineError::QuotaExceeded {
                reason: "max active runs".into(),
            });
        }
        if is_parent && self.limits.max_parent_runs > 0 && parents >= self.limits.max_parent_runs {
            return Err(EngineError::QuotaExceeded {
                reason: "max active parent runs".into(),
            });
        }
        Ok(())
    }

    /// Checks the unresolved-children ceiling for one parent before a spawn
    /// of `adding` more children.
    pub fn check_pending_children(&self, current: u32, adding: u32) -> Result<(), EngineError> {
        if self.limits.max_pending_subruns > 0
            && current + adding > self.limits.max_pending_subruns
        {
            return Err(EngineError::QuotaExceeded {
                reason: "max pending sub-runs per parent".into(),
            });
        }
        Ok(())
    }

    /// Reserves the run's single pending-approval slot.
    pub fn reserve_approval(&self, run_id: RunId) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.pending_approvals.insert(run_id) {
            Ok(())
        } else {
            Err(EngineError::QuotaExceeded {
                reason: "approval already pending for run".into(),
            })
        }
    }

    /// Frees the run's pending-approval slot. Idempotent.
    pub fn release_approval(&self, run_id: &RunId) {
        self.lock().pending_approvals.remove(run_id);
    }
}
