//! End-to-end tick flow: approval round-trip, stale ticks, lease
//! contention, and replay equivalence. Ticks are driven by hand through
//! `execute_tick` so every assertion sees a deterministic interleaving.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use runplane::{
    Directive, Engine, EngineBuilder, EngineConfig, ExternalCallError, ModelClient, QuotaLimits,
    RiskLevel, Run, RunStatus, Step, TickOutcome, TickRequest, ToolCallStatus, ToolExecutor,
    WorkspaceId, names, snapshot::RunProjection,
};

/// Pops directives per run input text; unscripted runs just finish.
struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<Directive>>>,
}

impl ScriptedModel {
    fn new(scripts: Vec<(&str, Vec<Directive>)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(input, script)| (input.to_string(), script.into()))
                    .collect(),
            ),
        })
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn consult(
        &self,
        run: &Run,
        _steps: &[Step],
        _ctx: CancellationToken,
    ) -> Result<Directive, ExternalCallError> {
        let next = self
            .scripts
            .lock()
            .expect("lock")
            .get_mut(&run.input_text)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or(Directive::Message("done".into())))
    }
}

struct EchoTools;

#[async_trait]
impl ToolExecutor for EchoTools {
    async fn execute(
        &self,
        name: &str,
        args: &Value,
        _ctx: CancellationToken,
    ) -> Result<Value, ExternalCallError> {
        Ok(json!({"tool": name, "echo": args}))
    }
}

/// Unlimited quotas: these tests exercise flow, not admission.
fn unlimited() -> QuotaLimits {
    QuotaLimits {
        max_parent_runs: 0,
        max_total_runs: 0,
        max_pending_subruns: 0,
        run_creation_per_sec: 0.0,
        spawn_per_sec: 0.0,
        snapshot_per_sec: 0.0,
    }
}

fn engine_with(model: Arc<dyn ModelClient>) -> Arc<Engine> {
    let cfg = EngineConfig {
        quota: unlimited(),
        ..EngineConfig::default()
    };
    EngineBuilder::new(cfg, model, Arc::new(EchoTools)).build()
}

/// Ticks a run at its current cursor.
async fn tick(engine: &Engine, run_id: runplane::RunId) -> TickOutcome {
    let cursor = engine.snapshot(run_id).expect("snapshot").run.cursor;
    engine
        .execute_tick(TickRequest::new(run_id, cursor))
        .await
        .expect("tick")
}

#[tokio::test]
async fn approval_flow_produces_the_expected_event_sequence() {
    let model = ScriptedModel::new(vec![(
        "audit the repo",
        vec![Directive::CallTool {
            name: "delete_branch".into(),
            args: json!({"branch": "stale"}),
            risk: RiskLevel::Dangerous,
            requires_approval: None,
        }],
    )]);
    let engine = engine_with(model);

    let run = engine
        .create_run(WorkspaceId::new(), "audit the repo")
        .expect("create");
    assert_eq!(run.status, RunStatus::Pending);

    // First tick: PENDING -> RUNNING (seq 1), then the risky tool call
    // parks the run (seq 2). Both in one commit.
    assert_eq!(tick(&engine, run.id).await, TickOutcome::Advanced);
    let snap = engine.snapshot(run.id).expect("snapshot");
    assert_eq!(snap.run.status, RunStatus::WaitingForApproval);
    assert_eq!(
        snap.events.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(snap.events[0].name, names::STATE_CHANGED);
    assert_eq!(snap.events[1].name, names::TOOL_CALL_REQUESTED);

    // Approval is seq 3.
    engine.approve_tool_call(run.id).expect("approve");

    // Final tick executes the cleared tool, folds the observation, the
    // model call, and the closing message into seq 4.
    assert_eq!(tick(&engine, run.id).await, TickOutcome::Advanced);
    let snap = engine.snapshot(run.id).expect("snapshot");
    assert_eq!(snap.run.status, RunStatus::Completed);
    assert_eq!(snap.run.final_text, "done");
    assert_eq!(snap.events.len(), 4);
    assert_eq!(snap.events[2].name, names::TOOL_CALL_APPROVED);
    assert_eq!(snap.events[3].payload["to"], "COMPLETED");
    assert_eq!(
        snap.events[3].payload["steps"].as_array().map(Vec::len),
        Some(3)
    );

    // A client that saw events 1 and 2 gets exactly 3 and 4.
    let runplane::ReplayResponse::Events { events } =
        engine.replay(run.id, Some(2)).expect("replay")
    else {
        panic!("expected an event tail");
    };
    assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);
}

#[tokio::test]
async fn replaying_the_event_log_rebuilds_live_state() {
    let model = ScriptedModel::new(vec![(
        "fetch and summarize",
        vec![
            Directive::CallTool {
                name: "fetch".into(),
                args: json!({"url": "https://example.test"}),
                risk: RiskLevel::Safe,
                requires_approval: None,
            },
            Directive::Message("summary ready".into()),
        ],
    )]);
    let engine = engine_with(model);
    let run = engine
        .create_run(WorkspaceId::new(), "fetch and summarize")
        .expect("create");

    while tick(&engine, run.id).await == TickOutcome::Advanced {}

    let snap = engine.snapshot(run.id).expect("snapshot");
    assert_eq!(snap.run.status, RunStatus::Completed);

    let projection = RunProjection::from_events(&snap.events);
    assert_eq!(projection.status, Some(snap.run.status));
    assert_eq!(projection.steps.len(), snap.steps.len());
    assert_eq!(projection.last_seq, snap.events.last().expect("events").seq);
}

#[tokio::test]
async fn stale_tick_mutates_nothing() {
    let model = ScriptedModel::new(vec![]);
    let engine = engine_with(model);
    let run = engine
        .create_run(WorkspaceId::new(), "one shot")
        .expect("create");

    // A duplicate enqueued at the creation cursor, delivered after the run
    // already advanced.
    let stale = TickRequest::new(run.id, run.cursor);
    assert_eq!(tick(&engine, run.id).await, TickOutcome::Advanced);
    let before = engine.snapshot(run.id).expect("snapshot");

    let outcome = engine.execute_tick(stale).await.expect("tick");
    assert_eq!(outcome, TickOutcome::Stale);
    let after = engine.snapshot(run.id).expect("snapshot");
    assert_eq!(after.run.cursor, before.run.cursor);
    assert_eq!(after.events.len(), before.events.len());
}

#[tokio::test]
async fn concurrent_tick_reports_busy() {
    struct GatedModel {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ModelClient for GatedModel {
        async fn consult(
            &self,
            _run: &Run,
            _steps: &[Step],
            _ctx: CancellationToken,
        ) -> Result<Directive, ExternalCallError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Directive::Message("done".into()))
        }
    }

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let engine = engine_with(Arc::new(GatedModel {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    }));

    let run = engine.create_run(WorkspaceId::new(), "slow").expect("create");
    let req = TickRequest::new(run.id, run.cursor);
    let holder = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.execute_tick(req).await })
    };
    entered.notified().await;

    // The lease is held while the model call is in flight.
    let outcome = engine.execute_tick(req).await.expect("tick");
    assert_eq!(outcome, TickOutcome::Busy);

    release.notify_one();
    let outcome = holder.await.expect("join").expect("tick");
    assert_eq!(outcome, TickOutcome::Advanced);
    assert_eq!(
        engine.snapshot(run.id).expect("snapshot").run.status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn rejected_command_pushes_nothing() {
    let model = ScriptedModel::new(vec![]);
    let cfg = EngineConfig {
        quota: QuotaLimits {
            max_parent_runs: 1,
            ..QuotaLimits::default()
        },
        ..EngineConfig::default()
    };
    let engine = EngineBuilder::new(cfg, model, Arc::new(EchoTools)).build();
    let workspace = WorkspaceId::new();

    engine.create_run(workspace, "first").expect("create");
    let mut rx = engine.subscribe();

    let err = engine
        .create_run(workspace, "second")
        .expect_err("over the parent ceiling");
    assert_eq!(err.as_label(), "engine_quota_exceeded");

    // Nothing was committed, so nothing was broadcast.
    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn step_budget_exhaustion_fails_the_run() {
    // The model loops on safe tool calls forever; the budget stops it.
    struct LoopingModel;

    #[async_trait]
    impl ModelClient for LoopingModel {
        async fn consult(
            &self,
            _run: &Run,
            _steps: &[Step],
            _ctx: CancellationToken,
        ) -> Result<Directive, ExternalCallError> {
            Ok(Directive::CallTool {
                name: "noop".into(),
                args: json!({}),
                risk: RiskLevel::Safe,
                requires_approval: None,
            })
        }
    }

    let cfg = EngineConfig {
        max_steps: 6,
        quota: QuotaLimits {
            run_creation_per_sec: 0.0,
            snapshot_per_sec: 0.0,
            ..QuotaLimits::default()
        },
        ..EngineConfig::default()
    };
    let engine = EngineBuilder::new(cfg, Arc::new(LoopingModel), Arc::new(EchoTools)).build();
    let run = engine
        .create_run(WorkspaceId::new(), "never ends")
        .expect("create");

    for _ in 0..10 {
        if tick(&engine, run.id).await != TickOutcome::Advanced {
            break;
        }
        if engine.snapshot(run.id).expect("snapshot").run.status.is_terminal() {
            break;
        }
    }

    let snap = engine.snapshot(run.id).expect("snapshot");
    assert_eq!(snap.run.status, RunStatus::Failed);
    assert!(snap.run.error_summary.contains("step budget"));
    assert_eq!(snap.events.last().expect("events").name, names::RUN_FAILED);
}

#[tokio::test(start_paused = true)]
async fn transient_model_failures_back_off_between_attempts() {
    // The model is down for the duration of the test; every consult must
    // wait out the retry delay, not spin back onto the queue.
    struct DownModel {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ModelClient for DownModel {
        async fn consult(
            &self,
            _run: &Run,
            _steps: &[Step],
            _ctx: CancellationToken,
        ) -> Result<Directive, ExternalCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExternalCallError::Transient {
                error: "model overloaded".into(),
            })
        }
    }

    let calls = Arc::new(AtomicU32::new(0));
    let engine = engine_with(Arc::new(DownModel {
        calls: Arc::clone(&calls),
    }));
    engine.start();

    let run = engine.create_run(WorkspaceId::new(), "flaky").expect("create");

    // One second fits only a handful of attempts under the default
    // 50ms-doubling backoff.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let consulted = calls.load(Ordering::SeqCst);
    assert!(consulted >= 2, "retries stopped entirely: {consulted}");
    assert!(consulted <= 10, "retries were not paced: {consulted}");

    // Transient failures commit nothing and never fail the run.
    let snap = engine.snapshot(run.id).expect("snapshot");
    assert_eq!(snap.run.status, RunStatus::Pending);
    assert!(snap.events.is_empty());

    engine.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn crashed_worker_loses_the_lease_and_the_run_recovers() {
    // The first consult dies mid-flight, taking its worker with it; the
    // lease it held is never released. Recovery has to come from the
    // reaper noticing the expired lease.
    struct CrashOnceModel {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ModelClient for CrashOnceModel {
        async fn consult(
            &self,
            _run: &Run,
            _steps: &[Step],
            _ctx: CancellationToken,
        ) -> Result<Directive, ExternalCallError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("worker died mid-consult");
            }
            Ok(Directive::Message("recovered".into()))
        }
    }

    let calls = Arc::new(AtomicU32::new(0));
    let cfg = EngineConfig {
        lease_ttl: Duration::from_millis(100),
        reaper_interval: Duration::from_millis(25),
        quota: unlimited(),
        ..EngineConfig::default()
    };
    let engine = EngineBuilder::new(
        cfg,
        Arc::new(CrashOnceModel {
            calls: Arc::clone(&calls),
        }),
        Arc::new(EchoTools),
    )
    .build();
    engine.start();

    let run = engine.create_run(WorkspaceId::new(), "fragile").expect("create");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if engine.snapshot(run.id).expect("snapshot").run.status == RunStatus::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run never recovered from the crashed tick"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let snap = engine.snapshot(run.id).expect("snapshot");
    assert_eq!(snap.run.final_text, "recovered");
    assert!(calls.load(Ordering::SeqCst) >= 2);
    // The crashed tick committed nothing: the recovery tick resumed from
    // the creation cursor and produced the only event.
    assert_eq!(snap.events.first().expect("events").seq, 1);
    assert_eq!(snap.events.first().expect("events").payload["from"], "PENDING");

    engine.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn cancel_closes_the_open_approval_gate() {
    let model = ScriptedModel::new(vec![(
        "risky work",
        vec![Directive::CallTool {
            name: "drop_table".into(),
            args: json!({"table": "users"}),
            risk: RiskLevel::Dangerous,
            requires_approval: None,
        }],
    )]);
    let engine = engine_with(model);
    let run = engine
        .create_run(WorkspaceId::new(), "risky work")
        .expect("create");

    assert_eq!(tick(&engine, run.id).await, TickOutcome::Advanced);
    assert_eq!(
        engine.snapshot(run.id).expect("snapshot").run.status,
        RunStatus::WaitingForApproval
    );

    engine.cancel(run.id, "operator abort").expect("cancel");

    let snap = engine.snapshot(run.id).expect("snapshot");
    assert_eq!(snap.run.status, RunStatus::Canceled);
    assert!(snap.run.cancel_requested);
    assert_eq!(
        snap.tool_calls.last().expect("tool call").status,
        ToolCallStatus::Canceled
    );

    // The gate is gone: a late approval has nothing to act on.
    let err = engine.approve_tool_call(run.id).expect_err("approve");
    assert_eq!(err.as_label(), "engine_invalid_command");
}

#[tokio::test]
async fn a_claimed_tool_call_is_recorded_as_running() {
    struct GatedTools {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ToolExecutor for GatedTools {
        async fn execute(
            &self,
            _name: &str,
            _args: &Value,
            _ctx: CancellationToken,
        ) -> Result<Value, ExternalCallError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(json!({"done": true}))
        }
    }

    let model = ScriptedModel::new(vec![(
        "fetch",
        vec![Directive::CallTool {
            name: "fetch".into(),
            args: json!({}),
            risk: RiskLevel::Safe,
            requires_approval: None,
        }],
    )]);
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let cfg = EngineConfig {
        quota: unlimited(),
        ..EngineConfig::default()
    };
    let engine = EngineBuilder::new(
        cfg,
        model,
        Arc::new(GatedTools {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        }),
    )
    .build();

    let run = engine.create_run(WorkspaceId::new(), "fetch").expect("create");
    assert_eq!(tick(&engine, run.id).await, TickOutcome::Advanced);
    assert_eq!(
        engine
            .snapshot(run.id)
            .expect("snapshot")
            .tool_calls
            .last()
            .expect("tool call")
            .status,
        ToolCallStatus::Pending
    );

    let holder = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { tick(&engine, run.id).await })
    };
    entered.notified().await;

    // The claim is durable while the call is in flight.
    assert_eq!(
        engine
            .snapshot(run.id)
            .expect("snapshot")
            .tool_calls
            .last()
            .expect("tool call")
            .status,
        ToolCallStatus::Running
    );

    release.notify_one();
    assert_eq!(holder.await.expect("join"), TickOutcome::Advanced);
    let snap = engine.snapshot(run.id).expect("snapshot");
    assert_eq!(
        snap.tool_calls.last().expect("tool call").status,
        ToolCallStatus::Completed
    );
    assert_eq!(snap.run.status, RunStatus::Completed);
}
