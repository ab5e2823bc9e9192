//! # Engine: wires the store, leases, quota, workers, and gateway together.
//!
//! The [`Engine`] owns every shared component and exposes the command
//! surface (create, approve, cancel, snapshot, ...). [`EngineBuilder`]
//! constructs it; [`Engine::start`] spawns the background machinery:
//!
//! ```text
//! EngineBuilder::new(cfg, model, tools)
//!     .with_subscribers(vec![...])
//!     .build()          ──► Arc<Engine>
//!
//! engine.start():
//!     ├── N worker loops          (tick queue → execute_tick)
//!     ├── lease reaper            (expired leases → recovery ticks)
//!     ├── reconcile sweep         (waiting parents, timeout deadlines)
//!     └── push listener           (bus → SubscriberSet fan-out)
//!
//! engine.shutdown():
//!     cancel token → join everything within `grace` → drain subscribers
//! ```
//!
//! ## Commit fan-out
//! Every successful transaction funnels through [`Engine::finish_commit`]:
//! it publishes the committed events, enqueues follow-up ticks for runs
//! left `Pending`/`Running`, and — for runs that went terminal — releases
//! quota reservations, cancels in-flight calls, and notifies the sub-run
//! coordinator. Coordinator cascades are driven iteratively from here, so
//! a deep cancel tree never recurses.

mod commands;
pub(crate) mod machine;
mod ticker;
mod worker;

pub use worker::TickRequest;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exec::{ModelRef, ToolsRef};
use crate::gateway::{Bus, PushMessage, Subscribe, SubscriberSet};
use crate::lease::LeaseManager;
use crate::model::RunId;
use crate::quota::QuotaGovernor;
use crate::store::{Committed, MemoryStore};

/// Builder for constructing an [`Engine`] with optional watchers.
pub struct EngineBuilder {
    cfg: EngineConfig,
    model: ModelRef,
    tools: ToolsRef,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl EngineBuilder {
    /// Creates a new builder with the given configuration and external
    /// execution seams.
    pub fn new(cfg: EngineConfig, model: ModelRef, tools: ToolsRef) -> Self {
        Self {
            cfg,
            model,
            tools,
            subscribers: Vec::new(),
        }
    }

    /// Sets push subscribers. Each gets a dedicated worker with a bounded
    /// queue; none of them can block the commit path.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds the engine. Call [`Engine::start`] to spawn the background
    /// machinery.
    pub fn build(self) -> Arc<Engine> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(self.subscribers));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Arc::new(Engine {
            leases: LeaseManager::new(self.cfg.lease_ttl),
            quota: QuotaGovernor::new(self.cfg.quota.clone()),
            store: MemoryStore::new(),
            model: self.model,
            tools: self.tools,
            bus,
            subs: StdMutex::new(Some(subs)),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            active_calls: StdMutex::new(HashMap::new()),
            shutdown_token: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
            cfg: self.cfg,
        })
    }
}

/// The control plane. One instance per process; shared via `Arc`.
pub struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) store: MemoryStore,
    pub(crate) leases: LeaseManager,
    pub(crate) quota: QuotaGovernor,
    pub(crate) model: ModelRef,
    pub(crate) tools: ToolsRef,
    pub(crate) bus: Bus,
    subs: StdMutex<Option<Arc<SubscriberSet>>>,
    queue_tx: mpsc::UnboundedSender<TickRequest>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<TickRequest>>>,
    pub(crate) active_calls: StdMutex<HashMap<RunId, CancellationToken>>,
    pub(crate) shutdown_token: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Spawns the worker pool, lease reaper, reconcile sweep, and push
    /// listener. Idempotent only in the sense that calling it twice spawns
    /// twice; call it once.
    pub fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();

        for _ in 0..self.cfg.workers_clamped() {
            handles.push(tokio::spawn(worker::worker_loop(
                Arc::clone(self),
                Arc::clone(&self.queue_rx),
                self.shutdown_token.clone(),
            )));
        }
        handles.push(tokio::spawn(Self::reaper_loop(Arc::clone(self))));
        handles.push(tokio::spawn(Self::reconcile_loop(Arc::clone(self))));
        if let Some(subs) = self.lock_subs().as_ref() {
            handles.push(tokio::spawn(Self::push_listener(
                self.bus.subscribe(),
                Arc::clone(subs),
                self.shutdown_token.clone(),
            )));
        }

        self.lock_tasks().extend(handles);
    }

    /// Graceful shutdown: cancel everything, wait up to the configured
    /// grace, abort stragglers, then drain subscriber queues.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.shutdown_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let join_all = async {
            for h in handles {
                let _ = h.await;
            }
        };
        let graceful = tokio::time::timeout(self.cfg.grace, join_all).await.is_ok();
        if !graceful {
            for a in aborts {
                a.abort();
            }
        }

        let subs = self.lock_subs().take();
        if let Some(subs) = subs {
            if let Some(subs) = Arc::into_inner(subs) {
                subs.shutdown().await;
            }
        }

        if graceful {
            Ok(())
        } else {
            Err(EngineError::GraceExceeded {
                grace: self.cfg.grace,
            })
        }
    }

    /// Queues a tick request. Never blocks.
    pub(crate) fn enqueue(&self, req: TickRequest) {
        let _ = self.queue_tx.send(req);
    }

    /// Re-enqueues a tick after the backoff delay for its attempt number,
    /// bumping the attempt count. Every retry path — lease contention,
    /// transient store failure, transient model failure — funnels through
    /// here so retries are always paced.
    pub(crate) fn schedule_retry(&self, req: TickRequest) {
        let delay = self.cfg.tick_retry.next(req.attempt);
        let tx = self.queue_tx.clone();
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(TickRequest {
                        attempt: req.attempt.saturating_add(1),
                        ..req
                    });
                }
            }
        });
    }

    /// Broadcasts every event of a committed batch.
    pub(crate) fn publish_events(&self, batch: &Committed) {
        for event in &batch.events {
            for msg in PushMessage::fan_out(event) {
                self.bus.publish(msg);
            }
        }
    }

    /// Post-commit fan-out. Iterative: coordinator cascades push further
    /// [`Committed`] batches onto the worklist instead of recursing.
    pub(crate) fn finish_commit(&self, committed: Committed) {
        let mut worklist = VecDeque::from([committed]);
        while let Some(batch) = worklist.pop_front() {
            self.publish_events(&batch);
            for run in &batch.runs {
                use crate::model::RunStatus::*;
                match run.status {
                    Pending | Running => {
                        self.enqueue(TickRequest::new(run.id, run.cursor));
                    }
                    status if status.is_terminal() => {
                        self.quota.release_approval(&run.id);
                        self.cancel_active_call(&run.id);
                        if run.parent_run_id.is_some() {
                            match self.child_finalized(run) {
                                Ok(next) => worklist.push_back(next),
                                Err(err) => {
                                    tracing::error!(
                                        run = %run.id,
                                        error = %err,
                                        "child finalization failed"
                                    );
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    async fn reaper_loop(engine: Arc<Engine>) {
        let mut interval = tokio::time::interval(engine.cfg.reaper_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = engine.shutdown_token.cancelled() => return,
                _ = interval.tick() => {
                    for run_id in engine.leases.reap_expired() {
                        match engine.store.get_run(&run_id) {
                            Ok(run) if !run.status.is_terminal() => {
                                tracing::warn!(run = %run_id, "lease expired; scheduling recovery tick");
                                engine.enqueue(TickRequest::new(run_id, run.cursor));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    async fn reconcile_loop(engine: Arc<Engine>) {
        let mut interval = tokio::time::interval(engine.cfg.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = engine.shutdown_token.cancelled() => return,
                _ = interval.tick() => {
                    let moved = engine.reconcile_once();
                    if moved > 0 {
                        tracing::debug!(moved, "reconcile sweep resumed parents");
                    }
                }
            }
        }
    }

    async fn push_listener(
        mut rx: tokio::sync::broadcast::Receiver<PushMessage>,
        subs: Arc<SubscriberSet>,
        token: CancellationToken,
    ) {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                msg = rx.recv() => match msg {
                    Ok(msg) => subs.emit(&msg),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "push listener lagged");
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    fn lock_subs(&self) -> std::sync::MutexGuard<'_, Option<Arc<SubscriberSet>>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
