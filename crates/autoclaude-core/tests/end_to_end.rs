//! End-to-end scenarios against a full in-process stack: store, gate,
//! arbiter, orchestrator, and a real worker pool running `sh -c` agent
//! stubs.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use autoclaude_core::alerts::AlertSink;
use autoclaude_core::arbiter::RateLimitArbiter;
use autoclaude_core::clock::{SharedClock, SystemClock};
use autoclaude_core::config::Config;
use autoclaude_core::gate::{SecurityGate, Verdict};
use autoclaude_core::metrics::{MetricsRegistry, SharedMetrics};
use autoclaude_core::orchestrator::Orchestrator;
use autoclaude_core::recovery::{AgentProber, RecoveryLoop};
use autoclaude_core::store::Store;
use autoclaude_core::task::{FailureKind, Task, TaskSpec, TaskState};
use autoclaude_core::worker::{ControlRegistry, Worker, WorkerContext, WorkerPool};
use tokio::sync::watch;

struct AlwaysUpProber;

#[async_trait::async_trait]
impl AgentProber for AlwaysUpProber {
    async fn probe(&self) -> bool {
        true
    }
}

struct Stack {
    config: Arc<Config>,
    store: Arc<Store>,
    arbiter: Arc<RateLimitArbiter>,
    orchestrator: Arc<Orchestrator>,
    metrics: SharedMetrics,
    clock: SharedClock,
    worker_ctx: WorkerContext,
    pool: WorkerPool,
    resource_ok: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

impl Stack {
    async fn start(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.base_dir = dir.path().to_path_buf();
        config.heartbeat_interval_seconds = 1;
        config.agent_timeout_seconds.light = 20;
        config.agent_timeout_seconds.medium = 20;
        config.agent_timeout_seconds.heavy = 20;
        config.shutdown_grace_seconds = 1;
        // Keep resource checks out of the way on small test hosts.
        config.min_disk_space_gb = 0;
        config.max_memory_used_percent = 100.0;
        tweak(&mut config);
        config.ensure_directories().unwrap();
        let config = Arc::new(config);

        let clock: SharedClock = Arc::new(SystemClock);
        let store = Arc::new(
            Store::open_with_clock(config.ledger_path(), clock.clone()).unwrap(),
        );
        let gate = Arc::new(SecurityGate::from_config(&config).unwrap());
        let arbiter = Arc::new(RateLimitArbiter::new(&config, clock.clone()));
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let alerts = Arc::new(AlertSink::new(config.logs_dir().join("alerts.jsonl")));
        let controls = Arc::new(ControlRegistry::new());
        let resource_ok = Arc::new(AtomicBool::new(true));

        let (orchestrator, outcome_tx) = Orchestrator::new(
            store.clone(),
            gate.clone(),
            arbiter.clone(),
            config.clone(),
            clock.clone(),
            controls.clone(),
            metrics.clone(),
            alerts,
        );
        let orchestrator = Arc::new(orchestrator);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run(shutdown_rx).await });
        }

        let worker_ctx = WorkerContext {
            store: store.clone(),
            gate,
            arbiter: arbiter.clone(),
            config: config.clone(),
            clock: clock.clone(),
            controls,
            outcomes: outcome_tx,
            resource_ok: resource_ok.clone(),
        };
        let pool = WorkerPool::spawn(&worker_ctx);

        Self {
            config,
            store,
            arbiter,
            orchestrator,
            metrics,
            clock,
            worker_ctx,
            pool,
            resource_ok,
            shutdown_tx,
            _dir: dir,
        }
    }

    fn submit(&self, name: &str, command: &str) -> (String, Verdict) {
        let spec = TaskSpec::builder()
            .name(name)
            .description(name)
            .command(command)
            .build();
        self.orchestrator.submit(&spec).unwrap()
    }

    async fn wait_for_state(&self, task_id: &str, state: TaskState, secs: u64) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
        loop {
            let task = self.store.get(task_id).unwrap().unwrap();
            if task.state == state {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} stuck in {} waiting for {state}",
                task.state
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.pool.shutdown().await;
    }
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn happy_path_completes_and_counts() {
    let stack = Stack::start(|_| {}).await;
    let (id, verdict) = stack.submit("echo-task", "echo ok");
    assert_eq!(verdict, Verdict::Allowed);

    let done = stack.wait_for_state(&id, TaskState::Completed, 15).await;
    assert_eq!(done.attempt_count, 1);
    assert!(done.worker_id.is_none());

    let log =
        std::fs::read_to_string(stack.config.task_dir(&id).join("output.log")).unwrap();
    assert!(log.contains("ok"));
    assert!((stack.metrics.core().task_run_count("completed") - 1.0).abs() < f64::EPSILON);

    stack.stop().await;
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn rate_limit_hit_then_resume_completes() {
    // One-second base wait so the cycle fits in a test.
    let stack = Stack::start(|c| c.default_unban_wait_seconds = 1).await;

    // First run announces a rate limit; subsequent runs succeed.
    let (id, _) = stack.submit(
        "flaky",
        "if test -f once; then echo ok; else touch once; echo 'rate limit exceeded'; exit 1; fi",
    );

    let waiting = stack.wait_for_state(&id, TaskState::WaitingUnban, 15).await;
    assert_eq!(waiting.attempt_count, 0, "a rate-limit event consumes no attempt");
    assert!(!stack.arbiter.is_available());
    assert!(waiting.next_attempt_at.is_some());

    // The recovery loop probes once the deadline passes; the stub agent
    // is healthy again.
    let mut recovery = RecoveryLoop::new(
        stack.store.clone(),
        stack.arbiter.clone(),
        stack.config.clone(),
        stack.clock.clone(),
        stack.metrics.clone(),
        Arc::new(AlertSink::new(stack.config.logs_dir().join("alerts.jsonl"))),
        Arc::new(AlwaysUpProber),
        stack.resource_ok.clone(),
    );
    let probe_deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !stack.arbiter.is_available() {
        assert!(tokio::time::Instant::now() < probe_deadline, "probe never fired");
        recovery.tick().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // waiting_unban -> retrying -> pending -> claimed -> completed.
    let done = stack.wait_for_state(&id, TaskState::Completed, 15).await;
    assert_eq!(done.attempt_count, 1);

    stack.stop().await;
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn blocked_command_never_spawns() {
    let stack = Stack::start(|_| {}).await;
    let (id, verdict) = stack.submit("wipe", "rm -rf /");
    assert_eq!(verdict, Verdict::Blocked);

    let parked = stack.wait_for_state(&id, TaskState::NeedsHumanReview, 5).await;
    assert_eq!(parked.attempt_count, 0);
    assert!(parked.started_at.is_none());

    // Give workers a chance to (wrongly) pick it up, then check nothing ran.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let still = stack.store.get(&id).unwrap().unwrap();
    assert_eq!(still.state, TaskState::NeedsHumanReview);
    assert!(!stack.config.task_dir(&id).join("output.log").exists());

    let findings = stack.store.findings_for(&id).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, "destructive_fs");

    stack.stop().await;
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn dead_worker_attempt_is_consumed_and_task_recovers() {
    // No real workers at first: a ghost claims and vanishes.
    let stack = Stack::start(|c| c.num_workers = 0).await;
    let (id, _) = stack.submit("medium-job", "echo recovered");

    // With zero workers nothing leaves pending.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        stack.store.get(&id).unwrap().unwrap().state,
        TaskState::Pending
    );

    let predicate = autoclaude_core::store::ClaimPredicate::all_classes(1);
    let (claimed, ghost_token) = stack.store.claim("ghost", &predicate).unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.attempt_count, 1);
    stack.store.heartbeat("ghost", 1, Some((id.as_str(), None))).unwrap();

    // Three heartbeat intervals pass with no beat; the recovery loop
    // un-claims the task, keeping the consumed attempt.
    let mut recovery = RecoveryLoop::new(
        stack.store.clone(),
        stack.arbiter.clone(),
        stack.config.clone(),
        stack.clock.clone(),
        stack.metrics.clone(),
        Arc::new(AlertSink::new(stack.config.logs_dir().join("alerts.jsonl"))),
        Arc::new(AlwaysUpProber),
        stack.resource_ok.clone(),
    );
    tokio::time::sleep(Duration::from_millis(3200)).await;
    recovery.tick().await;

    let requeued = stack.store.get(&id).unwrap().unwrap();
    assert_eq!(requeued.state, TaskState::Pending);
    assert_eq!(requeued.attempt_count, 1);
    assert_ne!(requeued.claim_token, ghost_token);

    // A real worker picks it up and finishes it.
    let (sd_tx, sd_rx) = watch::channel(false);
    let worker = Worker::new("worker_00".to_string(), stack.worker_ctx.clone(), sd_rx);
    let handle = tokio::spawn(worker.run());

    let done = stack.wait_for_state(&id, TaskState::Completed, 15).await;
    assert_eq!(done.attempt_count, 2);

    let _ = sd_tx.send(true);
    let _ = handle.await;
    stack.stop().await;
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn cancellation_mid_run_tears_down_within_grace() {
    let stack = Stack::start(|_| {}).await;
    let (id, _) = stack.submit("long-job", "sleep 30");

    let running = stack.wait_for_state(&id, TaskState::Processing, 15).await;
    assert!(running.worker_id.is_some());

    stack.orchestrator.cancel(&id).unwrap();
    let cancelled = stack.wait_for_state(&id, TaskState::Cancelled, 5).await;
    assert!(cancelled.worker_id.is_none());
    assert_eq!(cancelled.failure_kind, Some(FailureKind::Cancelled));

    stack.stop().await;
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn submit_then_cancel_immediately_never_spawns() {
    let stack = Stack::start(|c| c.num_workers = 0).await;
    let (id, _) = stack.submit("doomed", "echo never");
    stack.orchestrator.cancel(&id).unwrap();

    let cancelled = stack.wait_for_state(&id, TaskState::Cancelled, 5).await;
    assert_eq!(cancelled.attempt_count, 0);
    assert!(!stack.config.task_dir(&id).join("output.log").exists());

    stack.stop().await;
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn exhaustion_after_max_attempts() {
    let stack = Stack::start(|c| c.max_attempts = 2).await;
    let (id, _) = stack.submit("always-failing", "echo 'connection reset'; exit 1");

    let failed = stack.wait_for_state(&id, TaskState::Failed, 30).await;
    assert_eq!(failed.attempt_count, 2);
    assert_eq!(failed.failure_kind, Some(FailureKind::Exhausted));
    // The original classification survives in the history.
    assert!(failed.error_history.iter().any(|e| e.kind == "network"));
    assert!((stack.metrics.core().task_run_count("failed") - 1.0).abs() < f64::EPSILON);

    stack.stop().await;
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn single_attempt_cap_fails_exhausted() {
    let stack = Stack::start(|c| c.max_attempts = 1).await;
    let (id, _) = stack.submit("one-shot", "echo 'connection reset'; exit 1");

    let failed = stack.wait_for_state(&id, TaskState::Failed, 15).await;
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(failed.failure_kind, Some(FailureKind::Exhausted));

    stack.stop().await;
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn pause_and_resume_round_trip() {
    let stack = Stack::start(|_| {}).await;
    let (id, _) = stack.submit(
        "resumable",
        "if test -f paused_once; then echo done; else touch paused_once; sleep 30; fi",
    );

    stack.wait_for_state(&id, TaskState::Processing, 15).await;
    stack.orchestrator.pause(&id).unwrap();
    let paused = stack.wait_for_state(&id, TaskState::Paused, 10).await;
    // The claim survives the pause.
    assert!(paused.worker_id.is_some());

    stack.orchestrator.resume(&id).unwrap();
    let done = stack.wait_for_state(&id, TaskState::Completed, 20).await;
    // The pause/resume cycle stayed within the original attempt.
    assert_eq!(done.attempt_count, 1);

    stack.stop().await;
}
