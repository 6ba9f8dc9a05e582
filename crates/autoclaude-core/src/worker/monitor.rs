//! Subprocess supervision for one attempt.
//!
//! Spawns the agent CLI under `sh -c`, streams stdout and stderr line by
//! line through the security gate, watches for rate-limit signatures,
//! enforces the output cap and the per-class timeout, and honors pause,
//! cancel, and shutdown signals. The subprocess is torn down with
//! SIGTERM, a grace period, then SIGKILL.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{save_resume, ControlSignal, Outcome, WorkerContext};
use crate::arbiter::RateLimitReason;
use crate::resume::{ChunkPlan, ChunkTracker, ResumePayload};
use crate::store::TaskPatch;
use crate::task::{FailureKind, SecurityVerdict, Task, TaskState};

/// Cap on the output tail persisted in the store, per attempt.
pub const TAIL_LIMIT_BYTES: usize = 64 * 1024;

/// How one attempt ended, from the worker loop's point of view.
pub(super) enum AttemptEnd {
    /// The attempt produced an outcome to propose.
    Outcome(Outcome),
    /// Operator pause: the claim is retained, the worker parks.
    Paused,
    /// Worker shutdown: nothing is proposed, recovery re-queues.
    Shutdown,
}

/// Run one attempt of a claimed task to completion.
pub(super) async fn run_attempt(
    worker_id: &str,
    ctx: &WorkerContext,
    task: &Task,
    claim_token: &str,
    control: &mut watch::Receiver<ControlSignal>,
    shutdown: &mut watch::Receiver<bool>,
) -> AttemptEnd {
    // Re-read the row: a pause/resume cycle updates the resume blob.
    let current = match ctx.store.get(&task.id) {
        Ok(Some(current)) => current,
        _ => task.clone(),
    };

    // Apply the resume payload, when one is carried.
    let mut command = current.command.clone();
    let mut chunk_plan = ChunkPlan::default();
    if let Some(blob) = &current.resume_blob {
        match ResumePayload::from_blob(blob) {
            Ok(payload) => {
                command = crate::resume::rewrite_command(&command, &payload.preamble());
                if let ResumePayload::Chunks { plan } = payload {
                    chunk_plan = plan;
                }
            }
            Err(e) => warn!(task_id = %task.id, "ignoring corrupt resume blob: {e}"),
        }
    }
    let mut tracker = (current.class == crate::task::TaskClass::Heavy)
        .then(|| ChunkTracker::new(chunk_plan));

    let task_dir = ctx.config.task_dir(&task.id);
    if let Err(e) = std::fs::create_dir_all(&task_dir) {
        return AttemptEnd::Outcome(Outcome::Failed {
            kind: FailureKind::Resource,
            message: format!("cannot create task directory: {e}"),
        });
    }
    let log_path = task_dir.join("output.log");
    let mut log_file = match tokio::fs::File::create(&log_path).await {
        Ok(file) => file,
        Err(e) => {
            return AttemptEnd::Outcome(Outcome::Failed {
                kind: FailureKind::Resource,
                message: format!("cannot open output log: {e}"),
            });
        }
    };

    let working_dir = current
        .working_dir
        .clone()
        .unwrap_or_else(|| task_dir.display().to_string());

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&command)
        .current_dir(&working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    for (k, v) in &current.env {
        cmd.env(k, v);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return AttemptEnd::Outcome(Outcome::Failed {
                kind: FailureKind::ProcessCrash,
                message: format!("spawn failed: {e}"),
            });
        }
    };
    let agent_pid = child.id();
    info!(worker_id, task_id = %task.id, pid = ?agent_pid, "agent subprocess started");

    let _ = ctx.store.update_by_token(
        &task.id,
        claim_token,
        &TaskPatch {
            agent_pid: Some(agent_pid),
            ..Default::default()
        },
    );

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut stdout_lines = stdout.map(|s| BufReader::new(s).lines());
    let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());

    let grace = Duration::from_secs(ctx.config.shutdown_grace_seconds);
    let timeout = tokio::time::sleep(Duration::from_secs(
        ctx.config.timeout_for(current.class),
    ));
    tokio::pin!(timeout);
    let mut hb = tokio::time::interval(Duration::from_secs(
        ctx.config.heartbeat_interval_seconds,
    ));

    let mut tail = String::new();
    let mut pending = String::new();
    let mut total_bytes: u64 = 0;
    let mut masked_any = false;
    let pid = std::process::id();

    macro_rules! flush_tail {
        () => {
            if !pending.is_empty() {
                let patch = TaskPatch {
                    tail_append: Some(std::mem::take(&mut pending)),
                    tail_limit: Some(TAIL_LIMIT_BYTES),
                    ..Default::default()
                };
                if ctx
                    .store
                    .update_by_token(&task.id, claim_token, &patch)
                    .is_err()
                {
                    // Claim contested: the task was cancelled or
                    // re-assigned under us.
                    terminate(&mut child, agent_pid, grace).await;
                    return AttemptEnd::Outcome(Outcome::Cancelled);
                }
            }
        };
    }

    macro_rules! suspend_with_resume {
        () => {
            flush_tail!();
            save_resume(
                ctx,
                &current,
                claim_token,
                &tail,
                tracker.take().map(ChunkTracker::into_plan),
            );
            terminate(&mut child, agent_pid, grace).await;
        };
    }

    loop {
        let stdout_open = stdout_lines.is_some();
        let stderr_open = stderr_lines.is_some();
        if !stdout_open && !stderr_open {
            break;
        }

        tokio::select! {
            line = next_line(&mut stdout_lines), if stdout_open => {
                let Some(line) = line else { continue };
                if let Some(end) = handle_line(
                    ctx, &task.id, claim_token, &line, &mut log_file,
                    &mut tail, &mut pending, &mut total_bytes, &mut masked_any,
                    &mut tracker,
                ).await {
                    match end {
                        LineVerdict::RateLimit { reason, retry_after } => {
                            suspend_with_resume!();
                            return AttemptEnd::Outcome(Outcome::RateLimited { reason, retry_after });
                        }
                        LineVerdict::OutputCap => {
                            suspend_with_resume!();
                            return AttemptEnd::Outcome(Outcome::Failed {
                                kind: FailureKind::Resource,
                                message: "output size limit exceeded".to_string(),
                            });
                        }
                    }
                }
            }
            line = next_line(&mut stderr_lines), if stderr_open => {
                let Some(line) = line else { continue };
                if let Some(end) = handle_line(
                    ctx, &task.id, claim_token, &line, &mut log_file,
                    &mut tail, &mut pending, &mut total_bytes, &mut masked_any,
                    &mut tracker,
                ).await {
                    match end {
                        LineVerdict::RateLimit { reason, retry_after } => {
                            suspend_with_resume!();
                            return AttemptEnd::Outcome(Outcome::RateLimited { reason, retry_after });
                        }
                        LineVerdict::OutputCap => {
                            suspend_with_resume!();
                            return AttemptEnd::Outcome(Outcome::Failed {
                                kind: FailureKind::Resource,
                                message: "output size limit exceeded".to_string(),
                            });
                        }
                    }
                }
            }
            _ = hb.tick() => {
                let _ = ctx.store.heartbeat(worker_id, pid, Some((task.id.as_str(), agent_pid)));
                flush_tail!();
                // Operator pause may arrive through the store from another
                // process (the CLI); the in-process path signals directly.
                if let Ok(Some(row)) = ctx.store.get(&task.id) {
                    if row.state == TaskState::Paused && row.claim_token == claim_token {
                        suspend_with_resume!();
                        return AttemptEnd::Paused;
                    }
                }
            }
            () = &mut timeout => {
                debug!(task_id = %task.id, "per-class timeout elapsed");
                suspend_with_resume!();
                return AttemptEnd::Outcome(Outcome::Failed {
                    kind: FailureKind::ProcessHang,
                    message: "subprocess timed out".to_string(),
                });
            }
            _ = control.changed() => {
                let signal = *control.borrow_and_update();
                match signal {
                    ControlSignal::Cancel => {
                        suspend_with_resume!();
                        return AttemptEnd::Outcome(Outcome::Cancelled);
                    }
                    ControlSignal::Pause => {
                        suspend_with_resume!();
                        return AttemptEnd::Paused;
                    }
                    ControlSignal::Run => {}
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    suspend_with_resume!();
                    return AttemptEnd::Shutdown;
                }
            }
        }
    }

    // Streams closed: collect the exit status. A child that closed its
    // pipes but refuses to exit is still bounded by the class timeout.
    let status = match tokio::time::timeout_at(timeout.deadline(), child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            suspend_with_resume!();
            return AttemptEnd::Outcome(Outcome::Failed {
                kind: FailureKind::ProcessHang,
                message: "subprocess timed out".to_string(),
            });
        }
    };
    flush_tail!();
    let _ = ctx.store.update_by_token(
        &task.id,
        claim_token,
        &TaskPatch {
            agent_pid: Some(None),
            ..Default::default()
        },
    );

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return AttemptEnd::Outcome(Outcome::Failed {
                kind: FailureKind::ProcessCrash,
                message: format!("wait failed: {e}"),
            });
        }
    };

    if status.success() {
        // Persist heavy progress even on success, for audit.
        if tracker.is_some() {
            save_resume(
                ctx,
                &current,
                claim_token,
                &tail,
                tracker.take().map(ChunkTracker::into_plan),
            );
        }
        info!(task_id = %task.id, "agent subprocess exited cleanly");
        return AttemptEnd::Outcome(Outcome::Completed);
    }

    // Non-zero exit: the tail decides. A rate-limit signature that
    // slipped past line streaming (process exited first) is still a
    // rate-limit event, not a failure.
    let class = ctx.gate.classify(&tail);
    save_resume(
        ctx,
        &current,
        claim_token,
        &tail,
        tracker.take().map(ChunkTracker::into_plan),
    );
    if class.kind == FailureKind::RateLimited {
        return AttemptEnd::Outcome(Outcome::RateLimited {
            reason: RateLimitReason::infer(&tail),
            retry_after: class.retry_after,
        });
    }
    let message = tail_summary(&tail, status.code());
    AttemptEnd::Outcome(Outcome::Failed {
        kind: class.kind,
        message,
    })
}

/// What a streamed line demands beyond bookkeeping.
enum LineVerdict {
    RateLimit {
        reason: RateLimitReason,
        retry_after: Option<u64>,
    },
    OutputCap,
}

#[allow(clippy::too_many_arguments)] // one call site; bundling would only rename the locals
async fn handle_line(
    ctx: &WorkerContext,
    task_id: &str,
    claim_token: &str,
    line: &str,
    log_file: &mut tokio::fs::File,
    tail: &mut String,
    pending: &mut String,
    total_bytes: &mut u64,
    masked_any: &mut bool,
    tracker: &mut Option<ChunkTracker>,
) -> Option<LineVerdict> {
    *total_bytes += line.len() as u64 + 1;
    if *total_bytes > ctx.config.max_output_size_bytes {
        return Some(LineVerdict::OutputCap);
    }

    if ctx.gate.is_rate_limited(line) {
        return Some(LineVerdict::RateLimit {
            reason: RateLimitReason::infer(line),
            retry_after: ctx.gate.parse_retry_after(line),
        });
    }

    let masked = ctx.gate.mask_output(line);
    if !masked.findings.is_empty() {
        if let Err(e) = ctx.store.record_findings(task_id, &masked.findings) {
            warn!(task_id, "failed to record masking findings: {e}");
        }
        if let Err(e) = ctx.gate.audit(task_id, &masked.findings) {
            warn!(task_id, "failed to audit masking findings: {e}");
        }
        if !*masked_any {
            *masked_any = true;
            let _ = ctx.store.update_by_token(
                task_id,
                claim_token,
                &TaskPatch {
                    security_verdict: Some(SecurityVerdict::Masked),
                    ..Default::default()
                },
            );
        }
    }

    if let Some(tracker) = tracker {
        tracker.observe(&masked.text);
    }

    let _ = log_file.write_all(masked.text.as_bytes()).await;
    let _ = log_file.write_all(b"\n").await;

    tail.push_str(&masked.text);
    tail.push('\n');
    if tail.len() > TAIL_LIMIT_BYTES {
        let cut = tail.len() - TAIL_LIMIT_BYTES;
        let boundary = (cut..tail.len())
            .find(|i| tail.is_char_boundary(*i))
            .unwrap_or(tail.len());
        tail.drain(..boundary);
    }
    pending.push_str(&masked.text);
    pending.push('\n');
    None
}

type Lines<R> = tokio::io::Lines<BufReader<R>>;

/// Next line from an optional stream; closes the stream (sets `None`) on
/// EOF or error and yields `None` for that poll.
async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(inner) = lines.as_mut() else {
        return None;
    };
    match inner.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *lines = None;
            None
        }
        Err(e) => {
            debug!("output stream read error: {e}");
            *lines = None;
            None
        }
    }
}

/// SIGTERM the process group, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, agent_pid: Option<u32>, grace: Duration) {
    if let Some(pid) = agent_pid {
        #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
        let pgid = Pid::from_raw(pid as i32);
        if killpg(pgid, Signal::SIGTERM).is_err() {
            // Process already gone.
            let _ = child.wait().await;
            return;
        }
        let graceful = tokio::time::timeout(grace, child.wait()).await;
        if graceful.is_ok() {
            return;
        }
        warn!(pid, "subprocess ignored SIGTERM, killing");
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Compress the masked tail into a one-line failure summary.
fn tail_summary(tail: &str, exit_code: Option<i32>) -> String {
    let last = tail
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    let mut summary = match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    };
    if !last.is_empty() {
        let mut last = last.to_string();
        if last.len() > 300 {
            let boundary = (0..=300).rev().find(|i| last.is_char_boundary(*i)).unwrap_or(0);
            last.truncate(boundary);
        }
        summary.push_str(": ");
        summary.push_str(&last);
    }
    summary
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::arbiter::RateLimitArbiter;
    use crate::clock::SystemClock;
    use crate::config::Config;
    use crate::gate::SecurityGate;
    use crate::store::{ClaimPredicate, Store};
    use crate::task::TaskSpec;
    use crate::worker::ControlRegistry;

    fn context(config: Config) -> (WorkerContext, mpsc::Receiver<super::super::WorkerReport>) {
        let config = Arc::new(config);
        let clock: crate::clock::SharedClock = Arc::new(SystemClock);
        let (tx, rx) = mpsc::channel(16);
        let ctx = WorkerContext {
            store: Arc::new(Store::in_memory().unwrap()),
            gate: Arc::new(SecurityGate::from_config(&config).unwrap()),
            arbiter: Arc::new(RateLimitArbiter::new(&config, clock.clone())),
            config,
            clock,
            controls: Arc::new(ControlRegistry::new()),
            outcomes: tx,
            resource_ok: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        };
        (ctx, rx)
    }

    fn test_config() -> (Config, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.base_dir = dir.path().to_path_buf();
        config.agent_timeout_seconds.light = 5;
        config.shutdown_grace_seconds = 1;
        (config, dir)
    }

    async fn claimed(
        ctx: &WorkerContext,
        command: &str,
    ) -> (crate::task::Task, String) {
        let id = ctx
            .store
            .submit(&TaskSpec::builder().name("t").command(command).build())
            .unwrap();
        let (task, token) = ctx
            .store
            .claim("worker_00", &ClaimPredicate::all_classes(2))
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);
        (task, token)
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_clean_exit_completes() {
        let (config, _dir) = test_config();
        let (ctx, _rx) = context(config);
        let (task, token) = claimed(&ctx, "echo ok").await;
        let (_ctrl_tx, mut ctrl) = watch::channel(ControlSignal::Run);
        let (_sd_tx, mut sd) = watch::channel(false);

        let end = run_attempt("worker_00", &ctx, &task, &token, &mut ctrl, &mut sd).await;
        assert!(matches!(end, AttemptEnd::Outcome(Outcome::Completed)));

        let log = std::fs::read_to_string(ctx.config.task_dir(&task.id).join("output.log"))
            .unwrap();
        assert!(log.contains("ok"));
        let row = ctx.store.get(&task.id).unwrap().unwrap();
        assert!(row.last_output_tail.contains("ok"));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_nonzero_exit_classifies_tail() {
        let (config, _dir) = test_config();
        let (ctx, _rx) = context(config);
        let (task, token) = claimed(&ctx, "echo 'connection reset by peer' >&2; exit 3").await;
        let (_ctrl_tx, mut ctrl) = watch::channel(ControlSignal::Run);
        let (_sd_tx, mut sd) = watch::channel(false);

        let end = run_attempt("worker_00", &ctx, &task, &token, &mut ctrl, &mut sd).await;
        let AttemptEnd::Outcome(Outcome::Failed { kind, message }) = end else {
            panic!("expected failure outcome");
        };
        assert_eq!(kind, FailureKind::Network);
        assert!(message.contains("exit code 3"));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_rate_limit_line_suspends() {
        let (config, _dir) = test_config();
        let (ctx, _rx) = context(config);
        let (task, token) =
            claimed(&ctx, "echo 'rate limit exceeded, retry after 2 hours'; sleep 30").await;
        let (_ctrl_tx, mut ctrl) = watch::channel(ControlSignal::Run);
        let (_sd_tx, mut sd) = watch::channel(false);

        let end = run_attempt("worker_00", &ctx, &task, &token, &mut ctrl, &mut sd).await;
        let AttemptEnd::Outcome(Outcome::RateLimited { retry_after, .. }) = end else {
            panic!("expected rate-limit outcome");
        };
        assert_eq!(retry_after, Some(7200));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_rate_limit_on_exit_still_detected() {
        let (config, _dir) = test_config();
        let (ctx, _rx) = context(config);
        let (task, token) = claimed(&ctx, "echo 'usage limit reached'; exit 1").await;
        let (_ctrl_tx, mut ctrl) = watch::channel(ControlSignal::Run);
        let (_sd_tx, mut sd) = watch::channel(false);

        let end = run_attempt("worker_00", &ctx, &task, &token, &mut ctrl, &mut sd).await;
        assert!(matches!(
            end,
            AttemptEnd::Outcome(Outcome::RateLimited { .. })
        ));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_timeout_kills_and_reports_hang() {
        let (mut config, _dir) = test_config();
        config.agent_timeout_seconds.light = 1;
        let (ctx, _rx) = context(config);
        let (task, token) = claimed(&ctx, "sleep 30").await;
        let (_ctrl_tx, mut ctrl) = watch::channel(ControlSignal::Run);
        let (_sd_tx, mut sd) = watch::channel(false);

        let end = run_attempt("worker_00", &ctx, &task, &token, &mut ctrl, &mut sd).await;
        let AttemptEnd::Outcome(Outcome::Failed { kind, .. }) = end else {
            panic!("expected failure outcome");
        };
        assert_eq!(kind, FailureKind::ProcessHang);
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_output_cap_kills_with_resource_kind() {
        let (mut config, _dir) = test_config();
        config.max_output_size_bytes = 64;
        let (ctx, _rx) = context(config);
        let (task, token) =
            claimed(&ctx, "while true; do echo 0123456789abcdef; done").await;
        let (_ctrl_tx, mut ctrl) = watch::channel(ControlSignal::Run);
        let (_sd_tx, mut sd) = watch::channel(false);

        let end = run_attempt("worker_00", &ctx, &task, &token, &mut ctrl, &mut sd).await;
        let AttemptEnd::Outcome(Outcome::Failed { kind, message }) = end else {
            panic!("expected failure outcome");
        };
        assert_eq!(kind, FailureKind::Resource);
        assert!(message.contains("output size"));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_cancel_signal_tears_down() {
        let (config, _dir) = test_config();
        let (ctx, _rx) = context(config);
        let (task, token) = claimed(&ctx, "sleep 30").await;
        let (ctrl_tx, mut ctrl) = watch::channel(ControlSignal::Run);
        let (_sd_tx, mut sd) = watch::channel(false);

        let attempt = run_attempt("worker_00", &ctx, &task, &token, &mut ctrl, &mut sd);
        tokio::pin!(attempt);
        tokio::select! {
            _ = &mut attempt => panic!("attempt finished before cancel"),
            () = tokio::time::sleep(Duration::from_millis(300)) => {
                ctrl_tx.send(ControlSignal::Cancel).unwrap();
            }
        }
        let end = attempt.await;
        assert!(matches!(end, AttemptEnd::Outcome(Outcome::Cancelled)));
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_sensitive_output_is_masked_in_log() {
        let (config, _dir) = test_config();
        let (ctx, _rx) = context(config);
        let (task, token) = claimed(&ctx, "echo 'reach me at ops@example.com'").await;
        let (_ctrl_tx, mut ctrl) = watch::channel(ControlSignal::Run);
        let (_sd_tx, mut sd) = watch::channel(false);

        let end = run_attempt("worker_00", &ctx, &task, &token, &mut ctrl, &mut sd).await;
        assert!(matches!(end, AttemptEnd::Outcome(Outcome::Completed)));

        let log = std::fs::read_to_string(ctx.config.task_dir(&task.id).join("output.log"))
            .unwrap();
        assert!(!log.contains("ops@example.com"));
        assert!(log.contains("***.com"));

        let row = ctx.store.get(&task.id).unwrap().unwrap();
        assert_eq!(row.security_verdict, SecurityVerdict::Masked);
        assert!(!ctx.store.findings_for(&task.id).unwrap().is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn test_heavy_task_records_chunk_plan() {
        let (config, _dir) = test_config();
        let (ctx, _rx) = context(config);
        let id = ctx
            .store
            .submit(
                &TaskSpec::builder()
                    .name("big")
                    .class(crate::task::TaskClass::Heavy)
                    .command("echo '[[chunk:a:start]]'; echo work; echo '[[chunk:a:done]]'")
                    .build(),
            )
            .unwrap();
        let (task, token) = ctx
            .store
            .claim("worker_00", &ClaimPredicate::all_classes(2))
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);
        let (_ctrl_tx, mut ctrl) = watch::channel(ControlSignal::Run);
        let (_sd_tx, mut sd) = watch::channel(false);

        let end = run_attempt("worker_00", &ctx, &task, &token, &mut ctrl, &mut sd).await;
        assert!(matches!(end, AttemptEnd::Outcome(Outcome::Completed)));

        let row = ctx.store.get(&id).unwrap().unwrap();
        let blob = row.resume_blob.expect("heavy task persists its plan");
        let ResumePayload::Chunks { plan } = ResumePayload::from_blob(&blob).unwrap() else {
            panic!("expected chunk payload");
        };
        assert!(plan.frozen);
        assert_eq!(plan.completed(), vec!["a"]);
    }

    #[test]
    fn test_tail_summary_shapes() {
        assert_eq!(tail_summary("", Some(2)), "exit code 2");
        assert_eq!(
            tail_summary("first\nlast line\n\n", Some(1)),
            "exit code 1: last line"
        );
        assert_eq!(tail_summary("", None), "killed by signal");
    }
}
