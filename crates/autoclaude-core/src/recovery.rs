//! Recovery loop.
//!
//! A single supervisor task that periodically reconciles what the store
//! says against what the OS shows: dead workers, orphaned agent
//! subprocesses, stuck tasks, resource pressure, rate-limit probing, and
//! retry eligibility. Every transition it issues is a compare-and-set;
//! losing a race to a live worker or the orchestrator is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alerts::{AlertLevel, AlertSink};
use crate::arbiter::RateLimitArbiter;
use crate::clock::SharedClock;
use crate::config::Config;
use crate::metrics::SharedMetrics;
use crate::resume::ResumePayload;
use crate::store::{Store, StoreError, TransitionPatch};
use crate::task::{FailureKind, Task, TaskState};
use crate::telemetry;

/// Issues the minimal agent invocation used to detect that a rate limit
/// has lifted. Swapped for a stub in tests.
#[async_trait::async_trait]
pub trait AgentProber: Send + Sync {
    /// Run one probe; true means the agent service responded normally.
    async fn probe(&self) -> bool;
}

/// Prober that runs the configured probe command under `sh -c`.
pub struct CommandProber {
    command: String,
    timeout: Duration,
}

impl CommandProber {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            command: config.probe_command.clone(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait::async_trait]
impl AgentProber for CommandProber {
    async fn probe(&self) -> bool {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let Ok(mut child) = child else { return false };
        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            _ => {
                let _ = child.kill().await;
                false
            }
        }
    }
}

/// The recovery loop.
pub struct RecoveryLoop {
    store: Arc<Store>,
    arbiter: Arc<RateLimitArbiter>,
    config: Arc<Config>,
    clock: SharedClock,
    metrics: SharedMetrics,
    alerts: Arc<AlertSink>,
    prober: Arc<dyn AgentProber>,
    resource_ok: Arc<AtomicBool>,

    /// Soft-ping deadlines for stuck-looking tasks.
    pings: HashMap<String, DateTime<Utc>>,
}

impl RecoveryLoop {
    /// Build the recovery loop.
    #[allow(clippy::too_many_arguments)] // assembled once, at boot
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        arbiter: Arc<RateLimitArbiter>,
        config: Arc<Config>,
        clock: SharedClock,
        metrics: SharedMetrics,
        alerts: Arc<AlertSink>,
        prober: Arc<dyn AgentProber>,
        resource_ok: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            arbiter,
            config,
            clock,
            metrics,
            alerts,
            prober,
            resource_ok,
            pings: HashMap::new(),
        }
    }

    /// Run until shutdown, ticking every health-check interval.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("recovery loop started");
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.config.health_check_interval_seconds,
        ));
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("recovery loop stopped");
    }

    /// One full sweep.
    pub async fn tick(&mut self) {
        self.reap_dead_workers();
        self.reap_orphan_subprocesses();
        self.check_stuck_tasks();
        self.check_resources();
        self.probe_rate_limit().await;
        self.requeue_eligible_retries();
    }

    /// Workers whose heartbeat is older than three intervals are dead:
    /// their tasks are un-claimed and their agent subprocesses killed.
    fn reap_dead_workers(&mut self) {
        let workers = match self.store.list_workers() {
            Ok(workers) => workers,
            Err(e) => {
                warn!("worker listing failed: {e}");
                return;
            }
        };
        let now = self.clock.now();
        let dead_after = chrono::Duration::seconds(
            3 * i64::try_from(self.config.heartbeat_interval_seconds).unwrap_or(30),
        );

        for worker in workers {
            if now - worker.heartbeat_at <= dead_after {
                continue;
            }
            warn!(worker_id = %worker.id, "worker heartbeat expired, reaping");

            if let Some(agent_pid) = worker.agent_pid {
                terminate_pid(agent_pid);
            }

            let claimed = self
                .store
                .sweep(&[TaskState::Processing, TaskState::Paused])
                .unwrap_or_default();
            for task in claimed
                .iter()
                .filter(|t| t.worker_id.as_deref() == Some(&worker.id))
            {
                self.unclaim(task, "worker died mid-attempt");
            }

            if let Err(e) = self.store.remove_worker(&worker.id) {
                warn!(worker_id = %worker.id, "failed to remove worker row: {e}");
            }
            self.alerts.emit(
                AlertLevel::P2,
                "worker reaped",
                format!("worker {} missed three heartbeats", worker.id),
                None,
                Some(&worker.id),
            );
        }
    }

    /// Kill agent subprocesses whose owning worker row no longer exists.
    fn reap_orphan_subprocesses(&self) {
        let workers = self.store.list_workers().unwrap_or_default();
        let live_agents: Vec<u32> = workers.iter().filter_map(|w| w.agent_pid).collect();

        let claimed = self
            .store
            .sweep(&[TaskState::Processing, TaskState::Paused])
            .unwrap_or_default();
        for task in claimed {
            let Some(agent_pid) = task.agent_pid else { continue };
            let owner_alive = task
                .worker_id
                .as_deref()
                .is_some_and(|id| workers.iter().any(|w| w.id == id));
            if !owner_alive && !live_agents.contains(&agent_pid) && pid_alive(agent_pid) {
                warn!(task_id = %task.id, agent_pid, "terminating orphaned agent subprocess");
                terminate_pid(agent_pid);
                self.unclaim(&task, "orphaned subprocess terminated");
            }
        }
    }

    /// Processing tasks with a live worker but a stale task heartbeat:
    /// give the worker one heartbeat interval to ack (its routine task
    /// heartbeat), then kill and retry.
    fn check_stuck_tasks(&mut self) {
        let now = self.clock.now();
        let heartbeat = i64::try_from(self.config.heartbeat_interval_seconds).unwrap_or(30);
        let stale_after = chrono::Duration::seconds(3 * heartbeat);
        let workers = self.store.list_workers().unwrap_or_default();

        let processing = self.store.sweep(&[TaskState::Processing]).unwrap_or_default();
        let mut still_stuck: HashMap<String, DateTime<Utc>> = HashMap::new();

        for task in processing {
            let stale = task
                .heartbeat_at
                .map_or(true, |at| now - at > stale_after);
            let worker_alive = task
                .worker_id
                .as_deref()
                .is_some_and(|id| workers.iter().any(|w| w.id == id && now - w.heartbeat_at <= stale_after));
            if !stale || !worker_alive {
                self.pings.remove(&task.id);
                continue;
            }

            match self.pings.get(&task.id) {
                None => {
                    debug!(task_id = %task.id, "task heartbeat stale, starting ping grace");
                    still_stuck
                        .insert(task.id.clone(), now + chrono::Duration::seconds(heartbeat));
                }
                Some(deadline) if now < *deadline => {
                    still_stuck.insert(task.id.clone(), *deadline);
                }
                Some(_) => {
                    warn!(task_id = %task.id, "task unresponsive past ping grace, recycling");
                    if let Some(agent_pid) = task.agent_pid {
                        terminate_pid(agent_pid);
                    }
                    self.unclaim(&task, "no heartbeat ack within grace");
                }
            }
        }
        self.pings = still_stuck;
    }

    /// Free the claim of a task whose worker is gone or unresponsive.
    /// The attempt the claim consumed stays consumed.
    fn unclaim(&self, task: &Task, why: &str) {
        // A medium task whose worker never saved a payload can still
        // resume from the persisted output tail.
        let resume_blob = if task.resume_blob.is_none() {
            ResumePayload::for_attempt(
                task.class,
                &task.last_output_tail,
                self.config.resume_context_lines,
                None,
            )
            .and_then(|p| p.to_blob().ok())
            .map(Some)
        } else {
            None
        };

        let result = self.store.transition(
            &task.id,
            &[TaskState::Processing, TaskState::Paused],
            TaskState::Pending,
            &TransitionPatch {
                release_claim: true,
                failure_kind: Some(Some(FailureKind::ProcessHang)),
                error: Some((FailureKind::ProcessHang, why.to_string())),
                resume_blob,
                ..Default::default()
            },
        );
        match result {
            Ok(_) => info!(task_id = %task.id, "task re-queued: {why}"),
            Err(StoreError::TransitionConflict { .. }) => {}
            Err(e) => warn!(task_id = %task.id, "un-claim failed: {e}"),
        }
    }

    /// Disk and memory thresholds; under pressure, halt dispatch and
    /// trigger retention cleanup.
    fn check_resources(&self) {
        let snapshot = match telemetry::snapshot(&self.config.base_dir) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("resource probe failed: {e}");
                return;
            }
        };
        self.metrics.core().disk_free_bytes(snapshot.disk_free_bytes);
        if let Some(percent) = snapshot.memory_used_percent {
            self.metrics.core().memory_used_percent(percent);
        }

        let disk_low = snapshot.disk_free_gb() < self.config.min_disk_space_gb;
        let memory_high = snapshot
            .memory_used_percent
            .is_some_and(|p| p > self.config.max_memory_used_percent);

        let was_ok = self.resource_ok.swap(!(disk_low || memory_high), Ordering::Relaxed);
        if disk_low || memory_high {
            if was_ok {
                self.alerts.emit(
                    AlertLevel::P1,
                    "resource pressure",
                    format!(
                        "dispatch halted: {} GB disk free, memory {}",
                        snapshot.disk_free_gb(),
                        snapshot
                            .memory_used_percent
                            .map_or_else(|| "unknown".to_string(), |p| format!("{p:.0}%")),
                    ),
                    None,
                    None,
                );
            }
            self.cleanup_retention();
        } else if !was_ok {
            self.alerts.emit(
                AlertLevel::P3,
                "resource pressure cleared",
                "dispatch resumed",
                None,
                None,
            );
        }
    }

    /// Purge terminal tasks past the retention grace and delete their
    /// working directories.
    fn cleanup_retention(&self) {
        let cutoff =
            self.clock.now() - chrono::Duration::days(i64::from(self.config.retention_days));
        match self.store.purge_terminal(cutoff) {
            Ok(purged) => {
                for task_id in purged {
                    let dir = self.config.task_dir(&task_id);
                    if dir.exists() {
                        if let Err(e) = std::fs::remove_dir_all(&dir) {
                            warn!(task_id, "failed to remove task directory: {e}");
                        }
                    }
                    debug!(task_id, "terminal task purged");
                }
            }
            Err(e) => warn!("retention purge failed: {e}"),
        }
    }

    /// Probe the agent service when the arbiter's deadline has passed.
    async fn probe_rate_limit(&self) {
        if !self.arbiter.probe_due() {
            return;
        }
        info!("probing agent service for rate-limit recovery");
        if self.prober.probe().await {
            self.arbiter.record_probe_success();
            self.metrics.core().rate_limit_available(true);
            self.alerts.emit(
                AlertLevel::P3,
                "agent service recovered",
                "rate limit lifted, dispatch resumes",
                None,
                None,
            );
        } else {
            self.arbiter.record_probe_failure();
        }
    }

    /// Move retrying tasks whose backoff has elapsed back to pending.
    fn requeue_eligible_retries(&self) {
        let retrying = self.store.sweep(&[TaskState::Retrying]).unwrap_or_default();
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
            if let Err(e) = result {
                if !matches!(e, StoreError::TransitionConflict { .. }) {
                    warn!(task_id = %task.id, "retry requeue failed: {e}");
                }
            }
        }
    }
}

/// Whether a PID refers to a live process.
fn pid_alive(pid: u32) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(pid as i32);
    kill(pid, None).is_ok()
}

/// Best-effort SIGTERM; processes that ignore it are caught on the next
/// sweep with SIGKILL.
fn terminate_pid(pid: u32) {
    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(pid as i32);
    if kill(pid, Signal::SIGTERM).is_err() {
        return;
    }
    // Escalate immediately if it is already a zombie-free second pass.
    std::thread::sleep(Duration::from_millis(50));
    if kill(pid, None).is_ok() {
        let _ = kill(pid, Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::arbiter::RateLimitReason;
    use crate::clock::{Clock, ManualClock};
    use crate::metrics::MetricsRegistry;
    use crate::store::{ClaimPredicate, TaskPatch};
    use crate::task::{TaskClass, TaskSpec};

    struct StubProber {
        response: AtomicBool,
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl AgentProber for StubProber {
        async fn probe(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        recovery: RecoveryLoop,
        store: Arc<Store>,
        arbiter: Arc<RateLimitArbiter>,
        clock: Arc<ManualClock>,
        prober: Arc<StubProber>,
        resource_ok: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.base_dir = dir.path().to_path_buf();
        // Resource thresholds stay out of the way on small test hosts.
        config.min_disk_space_gb = 0;
        config.max_memory_used_percent = 100.0;
        let config = Arc::new(config);

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let shared: SharedClock = clock.clone();
        let store = Arc::new(Store::in_memory_with_clock(shared.clone()).unwrap());
        let arbiter = Arc::new(RateLimitArbiter::new(&config, shared.clone()));
        let prober = Arc::new(StubProber {
            response: AtomicBool::new(true),
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let resource_ok = Arc::new(AtomicBool::new(true));

        let recovery = RecoveryLoop::new(
            store.clone(),
            arbiter.clone(),
            config,
            shared,
            Arc::new(MetricsRegistry::new().unwrap()),
            Arc::new(AlertSink::new(dir.path().join("alerts.jsonl"))),
            prober.clone(),
            resource_ok.clone(),
        );
        Harness {
            recovery,
            store,
            arbiter,
            clock,
            prober,
            resource_ok,
            _dir: dir,
        }
    }

    fn submit_and_claim(h: &Harness, class: TaskClass) -> (Task, String) {
        h.store
            .submit(
                &TaskSpec::builder()
                    .name("t")
                    .class(class)
                    .command("true")
                    .build(),
            )
            .unwrap();
        h.store
            .claim("w0", &ClaimPredicate::all_classes(4))
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dead_worker_task_requeued_with_attempt_consumed() {
        let mut h = harness();
        let (task, _token) = submit_and_claim(&h, TaskClass::Light);
        h.store.heartbeat("w0", 1, Some((task.id.as_str(), None))).unwrap();

        // Three heartbeat intervals pass without a beat.
        h.clock.advance_secs(91);
        h.recovery.tick().await;

        let requeued = h.store.get(&task.id).unwrap().unwrap();
        assert_eq!(requeued.state, TaskState::Pending);
        assert_eq!(requeued.attempt_count, 1);
        assert!(requeued.worker_id.is_none());
        assert_ne!(requeued.claim_token, task.claim_token);
        assert!(h.store.list_workers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_worker_left_alone() {
        let mut h = harness();
        let (task, _token) = submit_and_claim(&h, TaskClass::Light);
        h.store.heartbeat("w0", 1, Some((task.id.as_str(), None))).unwrap();

        h.clock.advance_secs(30);
        h.store.heartbeat("w0", 1, Some((task.id.as_str(), None))).unwrap();
        h.clock.advance_secs(30);
        h.recovery.tick().await;

        let untouched = h.store.get(&task.id).unwrap().unwrap();
        assert_eq!(untouched.state, TaskState::Processing);
        assert_eq!(untouched.worker_id.as_deref(), Some("w0"));
    }

    #[tokio::test]
    async fn test_dead_worker_medium_task_gets_resume_blob() {
        let mut h = harness();
        let (task, token) = submit_and_claim(&h, TaskClass::Medium);
        h.store.heartbeat("w0", 1, Some((task.id.as_str(), None))).unwrap();
        h.store
            .update_by_token(
                &task.id,
                &token,
                &TaskPatch {
                    tail_append: Some("progress line one\nprogress line two\n".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        h.clock.advance_secs(120);
        h.recovery.tick().await;

        let requeued = h.store.get(&task.id).unwrap().unwrap();
        assert_eq!(requeued.state, TaskState::Pending);
        let blob = requeued.resume_blob.expect("medium task gets a rebuilt blob");
        let ResumePayload::Context { lines } = ResumePayload::from_blob(&blob).unwrap() else {
            panic!("expected context payload");
        };
        assert_eq!(lines, vec!["progress line one", "progress line two"]);
    }

    #[tokio::test]
    async fn test_stuck_task_gets_ping_grace_before_recycle() {
        let mut h = harness();
        let (task, _token) = submit_and_claim(&h, TaskClass::Light);
        h.store.heartbeat("w0", 1, Some((task.id.as_str(), None))).unwrap();

        // The worker itself keeps beating, but stops touching the task.
        h.clock.advance_secs(120);
        h.store.heartbeat("w0", 1, None).unwrap();
        h.recovery.tick().await;

        // First detection only starts the grace window.
        assert_eq!(
            h.store.get(&task.id).unwrap().unwrap().state,
            TaskState::Processing
        );

        // Grace elapses with no ack: recycled.
        h.clock.advance_secs(31);
        h.store.heartbeat("w0", 1, None).unwrap();
        h.recovery.tick().await;
        assert_eq!(
            h.store.get(&task.id).unwrap().unwrap().state,
            TaskState::Pending
        );
    }

    #[tokio::test]
    async fn test_stuck_task_ack_clears_ping() {
        let mut h = harness();
        let (task, _token) = submit_and_claim(&h, TaskClass::Light);
        h.store.heartbeat("w0", 1, Some((task.id.as_str(), None))).unwrap();

        h.clock.advance_secs(120);
        h.store.heartbeat("w0", 1, None).unwrap();
        h.recovery.tick().await;
        assert!(!h.recovery.pings.is_empty());

        // The worker acks by touching the task again.
        h.store.heartbeat("w0", 1, Some((task.id.as_str(), None))).unwrap();
        h.recovery.tick().await;
        assert!(h.recovery.pings.is_empty());
        assert_eq!(
            h.store.get(&task.id).unwrap().unwrap().state,
            TaskState::Processing
        );
    }

    #[tokio::test]
    async fn test_probe_fires_only_after_deadline() {
        let mut h = harness();
        h.arbiter.record_hit(RateLimitReason::RequestRate, None);

        h.recovery.tick().await;
        assert_eq!(h.prober.calls.load(Ordering::SeqCst), 0);
        assert!(!h.arbiter.is_available());

        h.clock.advance_secs(3601);
        h.recovery.tick().await;
        assert_eq!(h.prober.calls.load(Ordering::SeqCst), 1);
        assert!(h.arbiter.is_available());
    }

    #[tokio::test]
    async fn test_failed_probe_extends_wait() {
        let mut h = harness();
        h.prober.response.store(false, Ordering::SeqCst);
        h.arbiter.record_hit(RateLimitReason::RequestRate, None);
        h.clock.advance_secs(3601);

        h.recovery.tick().await;
        assert_eq!(h.prober.calls.load(Ordering::SeqCst), 1);
        assert!(!h.arbiter.is_available());
        // Deadline pushed out: no immediate second probe.
        h.recovery.tick().await;
        assert_eq!(h.prober.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_requeue_after_backoff() {
        let mut h = harness();
        let (task, _token) = submit_and_claim(&h, TaskClass::Light);
        h.store
            .transition(
                &task.id,
                &[TaskState::Processing],
                TaskState::Retrying,
                &TransitionPatch {
                    release_claim: true,
                    next_attempt_at: Some(Some(h.clock.now() + chrono::Duration::seconds(60))),
                    ..Default::default()
                },
            )
            .unwrap();

        h.recovery.tick().await;
        assert_eq!(
            h.store.get(&task.id).unwrap().unwrap().state,
            TaskState::Retrying
        );

        h.clock.advance_secs(61);
        h.recovery.tick().await;
        assert_eq!(
            h.store.get(&task.id).unwrap().unwrap().state,
            TaskState::Pending
        );
    }

    #[tokio::test]
    async fn test_resources_stay_ok_on_healthy_host() {
        let mut h = harness();
        h.recovery.tick().await;
        assert!(h.resource_ok.load(Ordering::Relaxed));
    }
}
