//! Orchestrator.
//!
//! Couples the store, gate, arbiter, and worker pool: accepts
//! submissions, drains the worker outcome channel, applies the state
//! machine, reacts to arbiter availability changes, and carries the
//! operator operations (cancel, pause, resume, unblock).
//!
//! Workers propose outcomes; only the orchestrator transitions state.
//! Every transition is a compare-and-set in the store, so a lost race
//! with the recovery loop or a stale worker is a logged no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::alerts::{AlertLevel, AlertSink};
use crate::arbiter::{Availability, RateLimitArbiter};
use crate::clock::SharedClock;
use crate::command::generate_command;
use crate::config::Config;
use crate::gate::{GateError, SecurityGate, Verdict};
use crate::metrics::SharedMetrics;
use crate::store::{Store, StoreError, TransitionPatch};
use crate::task::{FailureKind, SecurityVerdict, Task, TaskSpec, TaskState};
use crate::worker::{ControlRegistry, ControlSignal, Outcome, WorkerReport};

/// Capacity of the worker outcome channel.
const OUTCOME_CHANNEL_CAPACITY: usize = 64;

/// Retry backoff cap in seconds.
const RETRY_BACKOFF_MAX_SECS: u64 = 300;

/// Orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The store rejected an operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The gate rejected an operation.
    #[error("gate error: {0}")]
    Gate(#[from] GateError),

    /// No task with the given ID.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The operation does not apply to the task's current state.
    #[error("task {task_id} is {state}, operation does not apply")]
    WrongState {
        /// Task operated on.
        task_id: String,
        /// Its current state.
        state: TaskState,
    },
}

/// The orchestrator.
pub struct Orchestrator {
    store: Arc<Store>,
    gate: Arc<SecurityGate>,
    arbiter: Arc<RateLimitArbiter>,
    config: Arc<Config>,
    clock: SharedClock,
    controls: Arc<ControlRegistry>,
    metrics: SharedMetrics,
    alerts: Arc<AlertSink>,
    outcomes: tokio::sync::Mutex<mpsc::Receiver<WorkerReport>>,
}

impl Orchestrator {
    /// Build the orchestrator. Returns the sender side of the outcome
    /// channel for the worker pool.
    #[allow(clippy::too_many_arguments)] // assembled once, at boot
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        gate: Arc<SecurityGate>,
        arbiter: Arc<RateLimitArbiter>,
        config: Arc<Config>,
        clock: SharedClock,
        controls: Arc<ControlRegistry>,
        metrics: SharedMetrics,
        alerts: Arc<AlertSink>,
    ) -> (Self, mpsc::Sender<WorkerReport>) {
        let (tx, rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
        (
            Self {
                store,
                gate,
                arbiter,
                config,
                clock,
                controls,
                metrics,
                alerts,
                outcomes: tokio::sync::Mutex::new(rx),
            },
            tx,
        )
    }

    /// Main loop: drain outcomes, follow availability, tick the queue.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("orchestrator started");
        let mut outcomes = self.outcomes.lock().await;
        let mut availability = self.arbiter.subscribe();
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                report = outcomes.recv() => {
                    match report {
                        Some(report) => self.apply_report(&report),
                        None => break,
                    }
                }
                result = availability.changed() => {
                    if result.is_err() {
                        break;
                    }
                    let snapshot = availability.borrow_and_update().clone();
                    self.on_availability(&snapshot);
                }
                _ = tick.tick() => self.tick(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("orchestrator stopped");
    }

    /// Accept a submission: generate the agent command, insert the task,
    /// and scan it. A verdict other than `Allowed` parks the task in
    /// `needs_human_review` before any worker can claim it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or audit sink fails.
    pub fn submit(&self, spec: &TaskSpec) -> Result<(String, Verdict), OrchestratorError> {
        let mut spec = spec.clone();
        if spec.command.is_none() {
            spec.command = Some(generate_command(
                &self.config,
                &spec.name,
                &spec.description,
                spec.class,
            ));
        }
        if spec.max_attempts.is_none() {
            spec.max_attempts = Some(self.config.max_attempts);
        }

        let task_id = self.store.submit(&spec)?;
        let command = spec.command.as_deref().unwrap_or_default();
        let (verdict, findings) = self.gate.scan_command(command);

        if verdict == Verdict::Allowed {
            self.store
                .mark_scanned(&task_id, SecurityVerdict::Allowed)?;
        } else {
            let parked = self.store.transition(
                &task_id,
                &[TaskState::Pending],
                TaskState::NeedsHumanReview,
                &TransitionPatch {
                    failure_kind: Some(Some(FailureKind::SecurityBlock)),
                    error: Some((
                        FailureKind::SecurityBlock,
                        format!("command scan verdict: {verdict}"),
                    )),
                    security_verdict: Some(SecurityVerdict::Blocked),
                    ..Default::default()
                },
            );
            match parked {
                Ok(_) => {
                    self.store.record_findings(&task_id, &findings)?;
                    self.gate.audit(&task_id, &findings)?;
                    self.alerts.emit(
                        AlertLevel::P1,
                        "task blocked by security scan",
                        format!("task {task_id} parked for review: {verdict}"),
                        Some(&task_id),
                        None,
                    );
                }
                // A dedup-key resubmission of a task that already left
                // pending: the original scan stands.
                Err(StoreError::TransitionConflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok((task_id, verdict))
    }

    /// Cancel a non-terminal task. A claimed task's worker is signalled
    /// and its subprocess torn down; the terminal transition happens here
    /// either way, rotating the claim token so stale worker writes fence
    /// out.
    ///
    /// # Errors
    ///
    /// Returns `WrongState` for tasks already terminal.
    pub fn cancel(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let task = self.require(task_id)?;
        if task.state.is_terminal() {
            return Err(OrchestratorError::WrongState {
                task_id: task_id.to_string(),
                state: task.state,
            });
        }

        let from: Vec<TaskState> = TaskState::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect();
        let cancelled = self.store.transition(
            task_id,
            &from,
            TaskState::Cancelled,
            &TransitionPatch {
                failure_kind: Some(Some(FailureKind::Cancelled)),
                error: Some((FailureKind::Cancelled, "cancelled by operator".to_string())),
                ..Default::default()
            },
        )?;
        // Tear down the subprocess, if a worker owns one.
        self.controls.signal(task_id, ControlSignal::Cancel);
        self.metrics.core().task_run("cancelled");
        info!(task_id, "task cancelled");
        Ok(cancelled)
    }

    /// Operator pause of a processing task. The owning worker keeps the
    /// claim, saves its resume payload, and parks.
    ///
    /// # Errors
    ///
    /// Returns `WrongState` unless the task is processing.
    pub fn pause(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let paused = self.transition_op(task_id, TaskState::Processing, TaskState::Paused)?;
        self.controls.signal(task_id, ControlSignal::Pause);
        Ok(paused)
    }

    /// Resume an operator-paused task.
    ///
    /// # Errors
    ///
    /// Returns `WrongState` unless the task is paused.
    pub fn resume(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let resumed = self.transition_op(task_id, TaskState::Paused, TaskState::Processing)?;
        self.controls.signal(task_id, ControlSignal::Run);
        Ok(resumed)
    }

    /// Operator unblock after security review: the task goes back to
    /// `pending` with an allowed verdict, so workers will not re-park it.
    ///
    /// # Errors
    ///
    /// Returns `WrongState` unless the task awaits review.
    pub fn unblock(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let task = self.require(task_id)?;
        if task.state != TaskState::NeedsHumanReview {
            return Err(OrchestratorError::WrongState {
                task_id: task_id.to_string(),
                state: task.state,
            });
        }
        let unblocked = self.store.transition(
            task_id,
            &[TaskState::NeedsHumanReview],
            TaskState::Pending,
            &TransitionPatch {
                failure_kind: Some(None),
                next_attempt_at: Some(None),
                security_verdict: Some(SecurityVerdict::Allowed),
                ..Default::default()
            },
        )?;
        info!(task_id, "task unblocked after review");
        Ok(unblocked)
    }

    /// Apply a worker's proposed outcome to the state machine.
    ///
    /// Reports carrying a stale claim token are discarded: the claim was
    /// rotated (cancellation, recovery) after the worker formed its
    /// proposal.
    pub fn apply_report(&self, report: &WorkerReport) {
        let task = match self.store.get(&report.task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %report.task_id, "report for purged task dropped");
                return;
            }
            Err(e) => {
                warn!(task_id = %report.task_id, "report lookup failed: {e}");
                return;
            }
        };
        if task.claim_token != report.claim_token {
            debug!(task_id = %task.id, "stale report dropped");
            self.controls.unregister(&task.id);
            return;
        }

        let result = match &report.outcome {
            Outcome::Completed => self.on_completed(&task),
            Outcome::Cancelled => self.on_cancelled(&task),
            Outcome::RateLimited {
                reason,
                retry_after,
            } => self.on_rate_limited(&task, *reason, *retry_after),
            Outcome::Failed { kind, message } => self.on_failed(&task, *kind, message),
        };
        if let Err(e) = result {
            match e {
                StoreError::TransitionConflict { .. } => {
                    debug!(task_id = %task.id, "outcome lost a transition race: {e}");
                }
                StoreError::IllegalTransition { .. } => {
                    // An outcome that maps to an illegal transition means a
                    // logic invariant broke somewhere.
                    self.alerts.emit(
                        AlertLevel::P1,
                        "state machine invariant violated",
                        format!("task {}: {e} ({})", task.id, FailureKind::Internal.as_str()),
                        Some(&task.id),
                        Some(&report.worker_id),
                    );
                }
                _ => warn!(task_id = %task.id, "failed to apply outcome: {e}"),
            }
        }
    }

    fn on_completed(&self, task: &Task) -> Result<(), StoreError> {
        self.store.transition(
            &task.id,
            &[TaskState::Processing],
            TaskState::Completed,
            &TransitionPatch::default(),
        )?;
        self.metrics.core().task_run("completed");
        info!(task_id = %task.id, attempts = task.attempt_count, "task completed");
        Ok(())
    }

    fn on_cancelled(&self, task: &Task) -> Result<(), StoreError> {
        self.store.transition(
            &task.id,
            &[TaskState::Processing, TaskState::Paused],
            TaskState::Cancelled,
            &TransitionPatch {
                failure_kind: Some(Some(FailureKind::Cancelled)),
                ..Default::default()
            },
        )?;
        self.metrics.core().task_run("cancelled");
        Ok(())
    }

    fn on_rate_limited(
        &self,
        task: &Task,
        reason: crate::arbiter::RateLimitReason,
        retry_after: Option<u64>,
    ) -> Result<(), StoreError> {
        let resume_at = self.arbiter.record_hit(reason, retry_after);
        self.metrics.core().rate_limit_available(false);
        self.store.transition(
            &task.id,
            &[TaskState::Processing],
            TaskState::WaitingUnban,
            &TransitionPatch {
                failure_kind: Some(Some(FailureKind::RateLimited)),
                error: Some((
                    FailureKind::RateLimited,
                    format!("rate limit ({})", reason.as_str()),
                )),
                next_attempt_at: Some(Some(resume_at)),
                release_claim: true,
                refund_attempt: true,
                ..Default::default()
            },
        )?;
        self.alerts.emit(
            AlertLevel::P3,
            "task suspended by rate limit",
            format!("task {} waits until {resume_at}", task.id),
            Some(&task.id),
            None,
        );
        Ok(())
    }

    fn on_failed(
        &self,
        task: &Task,
        kind: FailureKind,
        message: &str,
    ) -> Result<(), StoreError> {
        if kind == FailureKind::SecurityBlock {
            self.store.transition(
                &task.id,
                &[TaskState::Processing],
                TaskState::NeedsHumanReview,
                &TransitionPatch {
                    failure_kind: Some(Some(kind)),
                    error: Some((kind, message.to_string())),
                    security_verdict: Some(SecurityVerdict::Blocked),
                    release_claim: true,
                    ..Default::default()
                },
            )?;
            self.alerts.emit(
                AlertLevel::P1,
                "task blocked by security scan",
                format!("task {} parked for review", task.id),
                Some(&task.id),
                None,
            );
            return Ok(());
        }

        if kind.is_retriable() && task.attempt_count < task.max_attempts {
            let backoff = retry_backoff_secs(task.attempt_count);
            let next = self.clock.now() + chrono::Duration::seconds(backoff);
            self.store.transition(
                &task.id,
                &[TaskState::Processing],
                TaskState::Retrying,
                &TransitionPatch {
                    failure_kind: Some(Some(kind)),
                    error: Some((kind, message.to_string())),
                    next_attempt_at: Some(Some(next)),
                    release_claim: true,
                    ..Default::default()
                },
            )?;
            info!(
                task_id = %task.id,
                kind = kind.as_str(),
                attempt = task.attempt_count,
                backoff_secs = backoff,
                "attempt failed, will retry"
            );
            return Ok(());
        }

        // Terminal failure. Retriable kinds that ran out of attempts are
        // recorded as exhausted; the original kind stays in the history.
        let final_kind = if kind.is_retriable() {
            FailureKind::Exhausted
        } else {
            kind
        };
        self.store.transition(
            &task.id,
            &[TaskState::Processing],
            TaskState::Failed,
            &TransitionPatch {
                failure_kind: Some(Some(final_kind)),
                error: Some((kind, message.to_string())),
                ..Default::default()
            },
        )?;
        self.metrics.core().task_run("failed");
        let level = if kind == FailureKind::Internal {
            AlertLevel::P1
        } else {
            AlertLevel::P2
        };
        self.alerts.emit(
            level,
            "task failed",
            format!(
                "task {} failed ({}) after {} attempt(s): {message}",
                task.id,
                final_kind.as_str(),
                task.attempt_count
            ),
            Some(&task.id),
            None,
        );
        Ok(())
    }

    /// React to an arbiter availability change.
    fn on_availability(&self, snapshot: &Availability) {
        self.metrics.core().rate_limit_available(snapshot.available);
        if snapshot.available {
            self.promote_waiting();
        }
    }

    /// Move `waiting_unban` tasks to `retrying` once the arbiter has
    /// recovered.
    pub fn promote_waiting(&self) {
        let waiting = match self.store.sweep(&[TaskState::WaitingUnban]) {
            Ok(waiting) => waiting,
            Err(e) => {
                warn!("waiting_unban sweep failed: {e}");
                return;
            }
        };
        for task in waiting {
            let result = self.store.transition(
                &task.id,
                &[TaskState::WaitingUnban],
                TaskState::Retrying,
                &TransitionPatch {
                    next_attempt_at: Some(Some(self.clock.now())),
                    ..Default::default()
                },
            );
            match result {
                Ok(_) => info!(task_id = %task.id, "rate limit lifted, task queued for retry"),
                Err(StoreError::TransitionConflict { .. }) => {}
                Err(e) => warn!(task_id = %task.id, "promote failed: {e}"),
            }
        }
    }

    /// Move `retrying` tasks whose backoff has elapsed back to `pending`.
    pub fn promote_retrying(&self) {
        let retrying = match self.store.sweep(&[TaskState::Retrying]) {
            Ok(retrying) => retrying,
            Err(e) => {
                warn!("retrying sweep failed: {e}");
                return;
            }
        };
        let now = self.clock.now();
        for task in retrying {
            if task.next_attempt_at.is_some_and(|at| at > now) {
                continue;
            }
            let result = self.store.transition(
                &task.id,
                &[TaskState::Retrying],
                TaskState::Pending,
                &TransitionPatch::default(),
            );
            match result {
                Ok(_) => debug!(task_id = %task.id, "backoff elapsed, task pending"),
                Err(StoreError::TransitionConflict { .. }) => {}
                Err(e) => warn!(task_id = %task.id, "requeue failed: {e}"),
            }
        }
    }

    /// Periodic housekeeping: queue promotion and gauge refresh.
    pub fn tick(&self) {
        if self.arbiter.is_available() {
            self.promote_waiting();
        }
        self.promote_retrying();
        self.refresh_gauges();
    }

    fn refresh_gauges(&self) {
        if let Ok(counts) = self.store.counts_by_state() {
            for (state, count) in counts {
                self.metrics.core().queue_depth(&state, count);
            }
        }
        if let Ok(workers) = self.store.list_workers() {
            let now = self.clock.now();
            for worker in workers {
                let age = (now - worker.heartbeat_at).num_seconds().max(0);
                #[allow(clippy::cast_precision_loss)]
                self.metrics
                    .core()
                    .worker_heartbeat_age(&worker.id, age as f64);
            }
        }
        self.metrics
            .core()
            .rate_limit_available(self.arbiter.is_available());
    }

    fn require(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.store
            .get(task_id)?
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))
    }

    fn transition_op(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
    ) -> Result<Task, OrchestratorError> {
        let task = self.require(task_id)?;
        if task.state != from {
            return Err(OrchestratorError::WrongState {
                task_id: task_id.to_string(),
                state: task.state,
            });
        }
        Ok(self
            .store
            .transition(task_id, &[from], to, &TransitionPatch::default())?)
    }
}

/// Exponential retry backoff: 1s, 2s, 4s, ... capped at five minutes.
fn retry_backoff_secs(attempts: u32) -> i64 {
    let exp = attempts.saturating_sub(1).min(16);
    let secs = (1_u64 << exp).min(RETRY_BACKOFF_MAX_SECS);
    i64::try_from(secs).unwrap_or(i64::MAX)
}
