//! Worker pool.
//!
//! Each worker is a supervised tokio task that claims work, runs the
//! agent CLI subprocess, streams its output through the security gate,
//! and proposes an outcome to the orchestrator. Workers never decide the
//! next state themselves: they propose, the orchestrator disposes.

mod monitor;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::arbiter::{RateLimitArbiter, RateLimitReason};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::gate::{SecurityGate, Verdict};
use crate::resume::ResumePayload;
use crate::store::{ClaimPredicate, Store, TaskPatch};
use crate::task::{FailureKind, Task, TaskClass};

pub use monitor::TAIL_LIMIT_BYTES;

/// The outcome a worker proposes for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Subprocess exited 0.
    Completed,

    /// A rate-limit signature was observed; the event consumes no attempt.
    RateLimited {
        /// Flavor of the limit.
        reason: RateLimitReason,
        /// Server-suggested wait in seconds, when announced.
        retry_after: Option<u64>,
    },

    /// The attempt failed.
    Failed {
        /// Classification.
        kind: FailureKind,
        /// Masked error summary.
        message: String,
    },

    /// The attempt was cancelled under the worker.
    Cancelled,
}

/// One worker's proposal for a finished attempt, sent to the
/// orchestrator's outcome channel.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Proposing worker.
    pub worker_id: String,

    /// Task the attempt belonged to.
    pub task_id: String,

    /// The claim token the worker holds; stale tokens are discarded.
    pub claim_token: String,

    /// The proposed outcome.
    pub outcome: Outcome,
}

/// Control signal delivered to the worker owning a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlSignal {
    /// Keep running.
    #[default]
    Run,
    /// Operator pause: save resume state, kill the subprocess, keep the
    /// claim, wait.
    Pause,
    /// Tear down the subprocess and abandon the attempt.
    Cancel,
}

/// Registry of per-task control channels, shared between the
/// orchestrator (signalling side) and workers (listening side).
#[derive(Default)]
pub struct ControlRegistry {
    channels: std::sync::Mutex<std::collections::HashMap<String, watch::Sender<ControlSignal>>>,
}

impl ControlRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and get its control receiver. Called by the
    /// claiming worker.
    #[must_use]
    pub fn register(&self, task_id: &str) -> watch::Receiver<ControlSignal> {
        let (tx, rx) = watch::channel(ControlSignal::Run);
        self.channels
            .lock()
            .unwrap()
            .insert(task_id.to_string(), tx);
        rx
    }

    /// Signal the worker owning a task. Returns false when no worker is
    /// listening.
    pub fn signal(&self, task_id: &str, signal: ControlSignal) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(task_id)
            .is_some_and(|tx| tx.send(signal).is_ok())
    }

    /// Drop a task's channel once its attempt is over.
    pub fn unregister(&self, task_id: &str) {
        self.channels.lock().unwrap().remove(task_id);
    }
}

/// Everything a worker needs, injected at construction.
#[derive(Clone)]
pub struct WorkerContext {
    /// Durable store.
    pub store: Arc<Store>,
    /// Security gate.
    pub gate: Arc<SecurityGate>,
    /// Rate-limit arbiter.
    pub arbiter: Arc<RateLimitArbiter>,
    /// Configuration.
    pub config: Arc<Config>,
    /// Clock.
    pub clock: SharedClock,
    /// Per-task control channels.
    pub controls: Arc<ControlRegistry>,
    /// Outcome channel into the orchestrator.
    pub outcomes: mpsc::Sender<WorkerReport>,
    /// Cleared by the recovery loop under resource pressure; workers
    /// stop claiming until it recovers.
    pub resource_ok: Arc<std::sync::atomic::AtomicBool>,
}

impl WorkerContext {
    fn claim_predicate(&self) -> ClaimPredicate {
        ClaimPredicate {
            classes: [TaskClass::Light, TaskClass::Medium, TaskClass::Heavy]
                .into_iter()
                .map(|c| (c, self.config.concurrency_for(c)))
                .collect(),
        }
    }
}

/// A single worker.
pub struct Worker {
    id: String,
    ctx: WorkerContext,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    /// Create a worker with the given identity.
    #[must_use]
    pub const fn new(id: String, ctx: WorkerContext, shutdown: watch::Receiver<bool>) -> Self {
        Self { id, ctx, shutdown }
    }

    /// Main loop: heartbeat, wait out rate limits, claim, execute,
    /// propose. Returns when shutdown is signalled.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, "worker started");
        let poll = Duration::from_secs(1);
        let pid = std::process::id();

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.ctx.store.heartbeat(&self.id, pid, None) {
                warn!(worker_id = %self.id, "heartbeat failed: {e}");
            }

            // Resource pressure: the recovery loop halts new dispatch.
            if !self
                .ctx
                .resource_ok
                .load(std::sync::atomic::Ordering::Relaxed)
            {
                tokio::select! {
                    () = tokio::time::sleep(poll) => {}
                    _ = self.shutdown.changed() => {}
                }
                continue;
            }

            // Global pause: no new claims while the arbiter is unavailable.
            if !self.ctx.arbiter.is_available() {
                let mut availability = self.ctx.arbiter.subscribe();
                tokio::select! {
                    _ = availability.changed() => {}
                    _ = self.shutdown.changed() => {}
                    () = tokio::time::sleep(Duration::from_secs(
                        self.ctx.config.heartbeat_interval_seconds,
                    )) => {}
                }
                continue;
            }

            let claimed = match self.ctx.store.claim(&self.id, &self.ctx.claim_predicate()) {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(worker_id = %self.id, "claim failed: {e}");
                    tokio::time::sleep(poll).await;
                    continue;
                }
            };
            let Some((task, claim_token)) = claimed else {
                tokio::select! {
                    () = tokio::time::sleep(poll) => {}
                    _ = self.shutdown.changed() => {}
                }
                continue;
            };

            info!(worker_id = %self.id, task_id = %task.id, attempt = task.attempt_count,
                  "claimed task");
            let control = self.ctx.controls.register(&task.id);
            let outcome = self.execute(&task, &claim_token, control).await;
            self.ctx.controls.unregister(&task.id);

            match outcome {
                Some(outcome) => {
                    let report = WorkerReport {
                        worker_id: self.id.clone(),
                        task_id: task.id.clone(),
                        claim_token,
                        outcome,
                    };
                    if self.ctx.outcomes.send(report).await.is_err() {
                        // Orchestrator is gone; shut down.
                        break;
                    }
                }
                // Shutdown mid-attempt: the claim stays put and the
                // recovery loop re-queues the task on the next boot.
                None => break,
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Run one claimed task to an outcome. `None` means the worker shut
    /// down mid-attempt without proposing anything.
    async fn execute(
        &mut self,
        task: &Task,
        claim_token: &str,
        mut control: watch::Receiver<ControlSignal>,
    ) -> Option<Outcome> {
        // Scan on first contact; submission-time scans leave the verdict
        // as allowed, and operator unblocks do the same, so a re-scan here
        // only fires for tasks that arrived unscanned.
        if task.security_verdict == crate::task::SecurityVerdict::Unscanned {
            let (verdict, findings) = self.ctx.gate.scan_command(&task.command);
            if verdict != Verdict::Allowed {
                if let Err(e) = self.ctx.store.record_findings(&task.id, &findings) {
                    warn!(task_id = %task.id, "failed to record findings: {e}");
                }
                if let Err(e) = self.ctx.gate.audit(&task.id, &findings) {
                    warn!(task_id = %task.id, "failed to audit findings: {e}");
                }
                let _ = self.ctx.store.update_by_token(
                    &task.id,
                    claim_token,
                    &TaskPatch {
                        security_verdict: Some(crate::task::SecurityVerdict::Blocked),
                        ..Default::default()
                    },
                );
                return Some(Outcome::Failed {
                    kind: FailureKind::SecurityBlock,
                    message: format!("command scan verdict: {verdict}"),
                });
            }
            let _ = self.ctx.store.update_by_token(
                &task.id,
                claim_token,
                &TaskPatch {
                    security_verdict: Some(crate::task::SecurityVerdict::Allowed),
                    ..Default::default()
                },
            );
        }

        // Attempt loop: a pause parks the worker and loops back in to
        // re-spawn with the saved resume payload.
        loop {
            let end = monitor::run_attempt(
                &self.id,
                &self.ctx,
                task,
                claim_token,
                &mut control,
                &mut self.shutdown,
            )
            .await;
            match end {
                monitor::AttemptEnd::Outcome(outcome) => return Some(outcome),
                monitor::AttemptEnd::Shutdown => return None,
                monitor::AttemptEnd::Paused => {
                    debug!(task_id = %task.id, "attempt paused, parking");
                    match self.park(&task.id, &mut control).await {
                        ParkEnd::Resumed => {}
                        ParkEnd::Cancelled => return Some(Outcome::Cancelled),
                        ParkEnd::Shutdown => return None,
                    }
                }
            }
        }
    }

    /// Wait in the paused state, heartbeating, until resumed or
    /// cancelled. State changes issued from another process surface on
    /// the heartbeat tick.
    async fn park(&mut self, task_id: &str, control: &mut watch::Receiver<ControlSignal>) -> ParkEnd {
        let pid = std::process::id();
        let mut hb = tokio::time::interval(Duration::from_secs(
            self.ctx.config.heartbeat_interval_seconds,
        ));
        loop {
            tokio::select! {
                _ = control.changed() => {
                    match *control.borrow_and_update() {
                        ControlSignal::Run => return ParkEnd::Resumed,
                        ControlSignal::Cancel => return ParkEnd::Cancelled,
                        ControlSignal::Pause => {}
                    }
                }
                _ = hb.tick() => {
                    let _ = self.ctx.store.heartbeat(&self.id, pid, Some((task_id, None)));
                    match self.ctx.store.get(task_id) {
                        Ok(Some(row)) => match row.state {
                            crate::task::TaskState::Paused => {}
                            crate::task::TaskState::Processing => return ParkEnd::Resumed,
                            _ => return ParkEnd::Cancelled,
                        },
                        _ => return ParkEnd::Cancelled,
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return ParkEnd::Shutdown;
                    }
                }
            }
        }
    }
}

enum ParkEnd {
    Resumed,
    Cancelled,
    Shutdown,
}

/// Fixed-size pool of workers.
pub struct WorkerPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `config.num_workers` workers.
    #[must_use]
    pub fn spawn(ctx: &WorkerContext) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..ctx.config.num_workers)
            .map(|i| {
                let worker = Worker::new(
                    format!("worker_{i:02}"),
                    ctx.clone(),
                    shutdown_rx.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();
        Self {
            handles,
            shutdown_tx,
        }
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool is empty (`num_workers = 0`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown and wait for every worker to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Save the class-appropriate resume payload: through the fenced patch
/// into the store, and mirrored to `tasks/<id>/resume.blob` for
/// operators. Light tasks save nothing.
pub(crate) fn save_resume(
    ctx: &WorkerContext,
    task: &Task,
    claim_token: &str,
    output_tail: &str,
    chunk_plan: Option<crate::resume::ChunkPlan>,
) {
    let payload = ResumePayload::for_attempt(
        task.class,
        output_tail,
        ctx.config.resume_context_lines,
        chunk_plan,
    );
    let Some(payload) = payload else { return };
    match payload.to_blob() {
        Ok(blob) => {
            let blob_path = ctx.config.task_dir(&task.id).join("resume.blob");
            if let Err(e) = std::fs::write(&blob_path, &blob) {
                debug!(task_id = %task.id, "resume blob file not written: {e}");
            }
            let patch = TaskPatch {
                resume_blob: Some(Some(blob)),
                ..Default::default()
            };
            if let Err(e) = ctx.store.update_by_token(&task.id, claim_token, &patch) {
                debug!(task_id = %task.id, "resume blob not saved: {e}");
            }
        }
        Err(e) => warn!(task_id = %task.id, "resume blob serialization failed: {e}"),
    }
}
