//! # Tick worker pool.
//!
//! Independent workers drain one shared queue of [`TickRequest`]s; per-run
//! exclusivity comes from the lease manager, not worker affinity — any
//! worker may pick up any run's tick.
//!
//! ```text
//!  finish_commit / reaper / reconcile ──► queue (unbounded mpsc)
//!                                            │  shared rx behind async Mutex
//!                  worker 1 ◄── dequeue ─────┼────► worker N
//!                       │                    │
//!                       ▼                    ▼
//!                 execute_tick()       execute_tick()
//!                       │ Busy / store unavailable
//!                       └──► delayed re-enqueue (backoff + jitter)
//! ```

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, StoreError, TickOutcome};
use crate::model::RunId;

use super::Engine;

/// One unit of work for the pool: tick `run_id`, expecting the cursor it
/// was enqueued at. `attempt` counts Busy retries for backoff.
#[derive(Clone, Copy, Debug)]
pub struct TickRequest {
    pub run_id: RunId,
    pub expected_cursor: u64,
    pub attempt: u32,
}

impl TickRequest {
    pub fn new(run_id: RunId, expected_cursor: u64) -> Self {
        Self {
            run_id,
            expected_cursor,
            attempt: 0,
        }
    }
}

/// Worker loop: dequeue, tick, schedule retries for contended runs. Exits
/// when the engine token is cancelled or the queue closes.
pub(super) async fn worker_loop(
    engine: Arc<Engine>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<TickRequest>>>,
    token: CancellationToken,
) {
    loop {
        let req = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = token.cancelled() => return,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
            }
        };

        match engine.execute_tick(req).await {
            Ok(TickOutcome::Busy) => engine.schedule_retry(req),
            Ok(outcome) => {
                tracing::debug!(run = %req.run_id, outcome = outcome.as_label(), "tick");
            }
            // A run must never stall because the store hiccupped: the tick
            // committed nothing, so retrying from the same cursor is safe.
            Err(err) if retryable(&err) => {
                tracing::warn!(run = %req.run_id, error = %err, "tick hit a transient failure; retrying");
                engine.schedule_retry(req);
            }
            Err(err) => {
                tracing::error!(run = %req.run_id, error = %err, label = err.as_label(), "tick failed");
            }
        }
    }
}

/// Whether a failed tick should be re-enqueued instead of dropped.
fn retryable(err: &EngineError) -> bool {
    matches!(err, EngineError::Store(StoreError::Unavailable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunStatus;

    #[test]
    fn test_store_unavailable_is_retried_everything_else_dropped() {
        assert!(retryable(&EngineError::Store(StoreError::Unavailable)));
        assert!(!retryable(&EngineError::Store(StoreError::StaleTick)));
        assert!(!retryable(&EngineError::Store(StoreError::SequenceConflict(
            RunId::new()
        ))));
        assert!(!retryable(&EngineError::IllegalTransition {
            from: RunStatus::Pending,
            to: RunStatus::Completed,
        }));
    }
}
