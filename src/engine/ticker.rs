//! # Tick execution.
//!
//! One tick is one full progression unit for a run: execute a cleared tool
//! call (if any), consult the model, apply its directive, and commit the
//! whole outcome in a single store transaction. External calls are awaited
//! while holding the run's lease (renewed at half-TTL) but never the store
//! lock.
//!
//! ```text
//! execute_tick(req)
//!   ├─ try_acquire lease ── held elsewhere ──► Busy (re-enqueued by worker)
//!   ├─ cursor != expected ──────────────────► Stale (dropped silently)
//!   ├─ terminal / paused / waiting ─────────► Noop
//!   └─ Pending | Running:
//!        execute cleared tool ──► observation        (outside txn)
//!        consult model ─────────► directive          (outside txn)
//!        transact: guard cursor, fold steps, apply directive
//!        finish_commit(committed)                    (after the lock drops)
//! ```
//!
//! ## Rules
//! - Any error during computation leaves the store unchanged; the cursor
//!   guard makes retries safe.
//! - A failed tool call is a failed step, not a failed run: the model sees
//!   the failure observation and decides what to do next.
//! - A transient model failure commits the pending observation first, then
//!   re-enqueues the tick at the new cursor behind the retry backoff; the
//!   tool is never re-executed.

use std::future::Future;

use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, ExternalCallError, StoreError, TickOutcome};
use crate::exec::Directive;
use crate::lease::Lease;
use crate::model::{
    Run, RunId, RunStatus, Step, StepKind, ToolCall, ToolCallStatus, names,
};
use crate::store::StoreTxn;

use super::machine;
use super::worker::TickRequest;
use super::Engine;

/// Cursor guard shared by every mutating transaction of a tick.
fn guard(txn: &mut StoreTxn<'_>, id: &RunId, expected: u64) -> Result<(), EngineError> {
    if txn.run(id)?.cursor != expected {
        return Err(StoreError::StaleTick.into());
    }
    Ok(())
}

impl Engine {
    /// Idempotent tick entry point for the worker pool.
    pub async fn execute_tick(&self, req: TickRequest) -> Result<TickOutcome, EngineError> {
        let Some(lease) = self.leases.try_acquire(req.run_id) else {
            return Ok(TickOutcome::Busy);
        };
        let result = self.run_tick(&lease, req).await;
        self.unregister_call(&req.run_id);
        self.leases.release(&lease);
        match result {
            Err(EngineError::Store(StoreError::StaleTick)) => Ok(TickOutcome::Stale),
            other => other,
        }
    }

    async fn run_tick(
        &self,
        lease: &Lease,
        mut req: TickRequest,
    ) -> Result<TickOutcome, EngineError> {
        let run = self.store.get_run(&req.run_id)?;
        if run.cursor != req.expected_cursor {
            return Ok(TickOutcome::Stale);
        }
        if run.status.is_terminal() || run.status == RunStatus::Paused || run.status.is_waiting() {
            return Ok(TickOutcome::Noop);
        }

        if run.step_count >= run.max_steps {
            return self.fail_run(&req, "step budget exhausted").await;
        }

        let token = self.register_call(req.run_id);

        // Phase 1: execute a claimed tool call, if one is waiting. A call
        // found already `Running` was claimed by a tick whose lease was
        // reclaimed; re-running it is the recovery path, so executors must
        // tolerate a retry.
        let mut tool_result: Option<(ToolCall, Result<Value, ExternalCallError>)> = None;
        if run.status == RunStatus::Running {
            let cleared = self
                .store
                .tool_calls(&req.run_id)?
                .into_iter()
                .rev()
                .find(|c| {
                    matches!(
                        c.status,
                        ToolCallStatus::Pending | ToolCallStatus::Running
                    )
                });
            if let Some(call) = cleared {
                // Record the claim before executing. The commit stages no
                // event (nothing to broadcast) but bumps the cursor, so the
                // rest of the tick guards against the new value.
                let (_, marked) = self.store.transact(|txn| {
                    guard(txn, &req.run_id, req.expected_cursor)?;
                    txn.update_tool_call(
                        &req.run_id,
                        call.step_index,
                        ToolCallStatus::Running,
                        None,
                    )
                })?;
                if let Some(row) = marked.runs.first() {
                    req.expected_cursor = row.cursor;
                }
                let fut = self.tools.execute(&call.tool_name, &call.args, token.clone());
                match self.guarded_call(lease, fut).await {
                    Err(ExternalCallError::Canceled) => return Ok(TickOutcome::Noop),
                    out => tool_result = Some((call, out)),
                }
            }
        }

        // Phase 2: consult the model, with the fresh observation visible.
        let mut steps = self.store.steps(&req.run_id)?;
        if let Some((call, result)) = &tool_result {
            steps.push(observation_step(&run, call, result));
        }
        let fut = self.model.consult(&run, &steps, token.clone());
        let directive = match self.guarded_call(lease, fut).await {
            Ok(directive) => directive,
            Err(ExternalCallError::Canceled) => return Ok(TickOutcome::Noop),
            Err(err) if err.is_retryable() => {
                return self.commit_and_retry(&req, tool_result, &err).await;
            }
            Err(err) => {
                if let Some((call, result)) = tool_result {
                    // Persist the observation alongside the failure.
                    let (_, committed) = self.store.transact(|txn| {
                        guard(txn, &req.run_id, req.expected_cursor)?;
                        stage_tool_result(txn, &req.run_id, &call, &result)?;
                        stage_failure(txn, &req.run_id, &err.to_string())
                    })?;
                    self.finish_commit(committed);
                    return Ok(TickOutcome::Advanced);
                }
                return self.fail_run(&req, &err.to_string()).await;
            }
        };

        // Phase 3: one transaction folding everything the tick produced.
        let (_, committed) = self.store.transact(|txn| {
            guard(txn, &req.run_id, req.expected_cursor)?;
            if let Some((call, result)) = &tool_result {
                stage_tool_result(txn, &req.run_id, call, result)?;
            }
            txn.append_step(
                &req.run_id,
                StepKind::ModelCall,
                json!({"directive": directive_kind(&directive)}),
            )?;
            if txn.run(&req.run_id)?.status == RunStatus::Pending {
                machine::transition(
                    txn,
                    &req.run_id,
                    RunStatus::Running,
                    names::STATE_CHANGED,
                    json!({}),
                )?;
            }
            self.stage_directive(txn, &req.run_id, &directive)
        })?;
        self.finish_commit(committed);
        Ok(TickOutcome::Advanced)
    }

    /// Applies the model's directive inside the tick transaction.
    fn stage_directive(
        &self,
        txn: &mut StoreTxn<'_>,
        id: &RunId,
        directive: &Directive,
    ) -> Result<(), EngineError> {
        match directive {
            Directive::Message(text) => {
                txn.append_step(id, StepKind::Message, json!({"text": text}))?;
                let mut run = txn.run(id)?.clone();
                run.final_text = text.clone();
                txn.put_run(run)?;
                machine::transition(
                    txn,
                    id,
                    RunStatus::Completed,
                    names::STATE_CHANGED,
                    json!({"message": text}),
                )
            }
            Directive::CallTool {
                name,
                args,
                risk,
                requires_approval,
            } => {
                let needs_approval = requires_approval.unwrap_or_else(|| risk.requires_approval());
                let step_index = txn.append_step(
                    id,
                    StepKind::ToolCall,
                    json!({"tool": name, "args": args, "risk": risk.as_str()}),
                )?;
                let run = txn.run(id)?.clone();
                let status = if needs_approval {
                    ToolCallStatus::WaitingForApproval
                } else {
                    ToolCallStatus::Pending
                };
                txn.insert_tool_call(ToolCall {
                    run_id: *id,
                    step_index,
                    tool_name: name.clone(),
                    args: args.clone(),
                    risk: *risk,
                    requires_approval: needs_approval,
                    status,
                    result: Value::Null,
                    correlation_id: run.correlation_id,
                })?;
                if !needs_approval {
                    machine::flush_steps(txn, id)?;
                    return Ok(());
                }
                match self.quota.reserve_approval(*id) {
                    Ok(()) => machine::transition(
                        txn,
                        id,
                        RunStatus::WaitingForApproval,
                        names::TOOL_CALL_REQUESTED,
                        json!({"tool": name, "risk": risk.as_str(), "step_index": step_index}),
                    ),
                    Err(err) => {
                        // Slot taken: fail the step, keep the run alive.
                        txn.update_tool_call(
                            id,
                            step_index,
                            ToolCallStatus::Failed,
                            Some(json!({"error": err.to_string()})),
                        )?;
                        txn.append_step(
                            id,
                            StepKind::Observation,
                            json!({"ok": false, "tool": name, "error": err.to_string()}),
                        )?;
                        machine::flush_steps(txn, id)?;
                        Ok(())
                    }
                }
            }
            Directive::Spawn {
                specs,
                join,
                failure,
            } => match self.stage_spawn(txn, id, specs, *join, *failure) {
                Ok(_) => Ok(()),
                // Admission checks run before anything is staged, so a
                // refusal can be folded back as a failed observation.
                Err(EngineError::QuotaExceeded { reason }) => {
                    txn.append_step(
                        id,
                        StepKind::Observation,
                        json!({"ok": false, "spawn_refused": true, "error": reason}),
                    )?;
                    machine::flush_steps(txn, id)?;
                    Ok(())
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Commits the pending observation, then re-enqueues the tick at the new
    /// cursor so a transient model failure never re-executes the tool. The
    /// retry always goes through the backoff delay, never straight back onto
    /// the queue.
    async fn commit_and_retry(
        &self,
        req: &TickRequest,
        tool_result: Option<(ToolCall, Result<Value, ExternalCallError>)>,
        err: &ExternalCallError,
    ) -> Result<TickOutcome, EngineError> {
        tracing::warn!(run = %req.run_id, error = %err, "model call failed; retrying tick");
        match tool_result {
            Some((call, result)) => {
                let (_, committed) = self.store.transact(|txn| {
                    guard(txn, &req.run_id, req.expected_cursor)?;
                    stage_tool_result(txn, &req.run_id, &call, &result)?;
                    machine::flush_steps(txn, &req.run_id)?;
                    Ok(())
                })?;
                // Publish, but hold the follow-up tick behind the backoff
                // instead of the usual immediate enqueue.
                self.publish_events(&committed);
                let cursor = committed
                    .runs
                    .first()
                    .map(|r| r.cursor)
                    .unwrap_or(req.expected_cursor);
                self.schedule_retry(TickRequest {
                    run_id: req.run_id,
                    expected_cursor: cursor,
                    attempt: req.attempt,
                });
                Ok(TickOutcome::Advanced)
            }
            None => {
                self.schedule_retry(*req);
                Ok(TickOutcome::Noop)
            }
        }
    }

    async fn fail_run(&self, req: &TickRequest, reason: &str) -> Result<TickOutcome, EngineError> {
        let (_, committed) = self.store.transact(|txn| {
            guard(txn, &req.run_id, req.expected_cursor)?;
            stage_failure(txn, &req.run_id, reason)
        })?;
        self.finish_commit(committed);
        Ok(TickOutcome::Advanced)
    }

    /// Awaits an external call while keeping the lease alive, renewing at
    /// half-TTL. A lost lease cancels the call.
    async fn guarded_call<T>(
        &self,
        lease: &Lease,
        fut: impl Future<Output = Result<T, ExternalCallError>>,
    ) -> Result<T, ExternalCallError> {
        let fut = async {
            match self.cfg.call_timeout_opt() {
                Some(timeout) => tokio::time::timeout(timeout, fut)
                    .await
                    .unwrap_or(Err(ExternalCallError::Timeout { timeout })),
                None => fut.await,
            }
        };
        tokio::pin!(fut);
        let mut renew = tokio::time::interval(self.cfg.lease_renew_interval());
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = renew.tick() => {
                    if !self.leases.renew(lease) {
                        return Err(ExternalCallError::Canceled);
                    }
                }
            }
        }
    }

    fn register_call(&self, run_id: RunId) -> CancellationToken {
        let token = self.shutdown_token.child_token();
        self.active_calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(run_id, token.clone());
        token
    }

    fn unregister_call(&self, run_id: &RunId) {
        self.active_calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(run_id);
    }

    /// Signals the in-flight external call of a run, if any.
    pub(super) fn cancel_active_call(&self, run_id: &RunId) {
        let token = self
            .active_calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(run_id);
        if let Some(token) = token {
            token.cancel();
        }
    }
}

/// Stages tool completion/failure plus its observation step.
fn stage_tool_result(
    txn: &mut StoreTxn<'_>,
    id: &RunId,
    call: &ToolCall,
    result: &Result<Value, ExternalCallError>,
) -> Result<(), EngineError> {
    match result {
        Ok(value) => {
            txn.update_tool_call(
                id,
                call.step_index,
                ToolCallStatus::Completed,
                Some(value.clone()),
            )?;
            txn.append_step(
                id,
                StepKind::Observation,
                json!({"ok": true, "tool": call.tool_name, "result": value}),
            )?;
        }
        Err(err) => {
            txn.update_tool_call(
                id,
                call.step_index,
                ToolCallStatus::Failed,
                Some(json!({"error": err.to_string()})),
            )?;
            txn.append_step(
                id,
                StepKind::Observation,
                json!({"ok": false, "tool": call.tool_name, "error": err.to_string(), "label": err.as_label()}),
            )?;
        }
    }
    Ok(())
}

/// Stages a terminal failure transition with its reason.
fn stage_failure(txn: &mut StoreTxn<'_>, id: &RunId, reason: &str) -> Result<(), EngineError> {
    let mut run = txn.run(id)?.clone();
    run.error_summary = reason.to_string();
    txn.put_run(run)?;
    machine::transition(
        txn,
        id,
        RunStatus::Failed,
        names::RUN_FAILED,
        json!({"reason": reason}),
    )
}

fn directive_kind(directive: &Directive) -> &'static str {
    match directive {
        Directive::CallTool { .. } => "call_tool",
        Directive::Spawn { .. } => "spawn",
        Directive::Message(_) => "message",
    }
}

/// Synthetic, not-yet-persisted observation shown to the model in the same
/// tick the tool ran.
fn observation_step(
    run: &Run,
    call: &ToolCall,
    result: &Result<Value, ExternalCallError>,
) -> Step {
    let payload = match result {
        Ok(value) => json!({"ok": true, "tool": call.tool_name, "result": value}),
        Err(err) => json!({"ok": false, "tool": call.tool_name, "error": err.to_string()}),
    };
    Step {
        run_id: run.id,
        step_index: run.step_count + 1,
        kind: StepKind::Observation,
        payload,
        correlation_id: run.correlation_id,
        created_at: OffsetDateTime::now_utc(),
    }
}
