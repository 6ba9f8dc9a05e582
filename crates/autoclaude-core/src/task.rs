//! Task data model.
//!
//! The central entity of the system and its lifecycle vocabulary: states,
//! classes, priorities, failure kinds, and the legality of state
//! transitions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors for task model parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Unrecognized task state string.
    #[error("invalid task state: {0}")]
    InvalidState(String),

    /// Unrecognized task class string.
    #[error("invalid task class: {0}")]
    InvalidClass(String),

    /// Unrecognized priority string.
    #[error("invalid task priority: {0}")]
    InvalidPriority(String),

    /// Unrecognized failure kind string.
    #[error("invalid failure kind: {0}")]
    InvalidFailureKind(String),

    /// Illegal state transition.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: TaskState,
        /// Requested state.
        to: TaskState,
    },
}

/// Generate a fresh task identifier.
#[must_use]
pub fn new_task_id() -> String {
    format!("task_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// Generate a fresh worker identifier.
#[must_use]
pub fn new_worker_id() -> String {
    format!("worker_{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Generate a fresh claim fencing token.
#[must_use]
pub fn new_claim_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued and claimable.
    Pending,
    /// Claimed by a worker and executing.
    Processing,
    /// Operator-initiated pause; the claim is retained.
    Paused,
    /// Suspended by a rate limit; resumes when the arbiter recovers.
    WaitingUnban,
    /// Failed retriably; waiting out its backoff before requeueing.
    Retrying,
    /// Parked for operator review after a security verdict.
    NeedsHumanReview,
    /// Finished successfully (terminal).
    Completed,
    /// Finished unsuccessfully (terminal).
    Failed,
    /// Cancelled by the operator (terminal).
    Cancelled,
}

impl TaskState {
    /// All states, in queue-display order.
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Processing,
        Self::Paused,
        Self::WaitingUnban,
        Self::Retrying,
        Self::NeedsHumanReview,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Parses a state from its string form.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidState` for unrecognized input.
    pub fn parse(s: &str) -> Result<Self, TaskError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "paused" => Ok(Self::Paused),
            "waiting_unban" => Ok(Self::WaitingUnban),
            "retrying" => Ok(Self::Retrying),
            "needs_human_review" => Ok(Self::NeedsHumanReview),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(TaskError::InvalidState(s.to_string())),
        }
    }

    /// Returns the string representation of this state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::WaitingUnban => "waiting_unban",
            Self::Retrying => "retrying",
            Self::NeedsHumanReview => "needs_human_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for terminal states. Terminal transitions are
    /// monotonic: there is no way out.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true for states in which a worker holds the claim.
    #[must_use]
    pub const fn is_claimed(&self) -> bool {
        matches!(self, Self::Processing | Self::Paused)
    }

    /// Checks whether a transition from this state to `target` is legal.
    #[must_use]
    pub const fn can_transition_to(&self, target: &Self) -> bool {
        match (self, target) {
            (Self::Pending, Self::Processing)
            | (
                Self::Processing,
                Self::Completed
                    | Self::Failed
                    | Self::Paused
                    | Self::WaitingUnban
                    | Self::Retrying
                    | Self::NeedsHumanReview
                    // Recovery un-claim after a dead worker.
                    | Self::Pending,
            )
            | (Self::Paused, Self::Processing)
            | (Self::WaitingUnban, Self::Retrying)
            | (Self::Retrying, Self::Pending)
            | (Self::NeedsHumanReview, Self::Pending)
            // Exhaustion can fire from the retry path as well.
            | (Self::WaitingUnban | Self::Retrying, Self::Failed) => true,
            // Cancellation reaches every non-terminal state.
            (from, Self::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task complexity tier. Governs tool allow-list, timeout, and resume
/// strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    /// Simple tasks; a retry re-runs from scratch.
    Light,
    /// Needs partial output history to resume usefully.
    Medium,
    /// Chunked processing with frozen chunk boundaries.
    Heavy,
}

impl TaskClass {
    /// Parses a class from its string form. Accepts both the short names
    /// and the submission surface's long names.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidClass` for unrecognized input.
    pub fn parse(s: &str) -> Result<Self, TaskError> {
        match s {
            "light" | "lightweight" => Ok(Self::Light),
            "medium" | "medium_context" => Ok(Self::Medium),
            "heavy" | "heavy_context" => Ok(Self::Heavy),
            _ => Err(TaskError::InvalidClass(s.to_string())),
        }
    }

    /// Returns the string representation of this class.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        }
    }
}

impl std::fmt::Display for TaskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatch priority. A tiebreaker within the pending queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default.
    Normal,
    /// Preferred over normal work.
    High,
    /// Dispatched before everything else.
    Urgent,
}

impl TaskPriority {
    /// Parses a priority from its string form.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidPriority` for unrecognized input.
    pub fn parse(s: &str) -> Result<Self, TaskError> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(TaskError::InvalidPriority(s.to_string())),
        }
    }

    /// Returns the string representation of this priority.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    /// Rank used by the dispatch ordering; lower dispatches first.
    #[must_use]
    pub const fn dispatch_rank(&self) -> i64 {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a failure-ish terminal or retry condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rate limit surfaced to the arbiter; consumes no attempt.
    RateLimited,
    /// Transient network failure; retriable.
    Network,
    /// Disk, memory, or permission pressure; pauses dispatch globally.
    Resource,
    /// Timeout or heartbeat miss; kill and retry.
    ProcessHang,
    /// Non-zero exit not otherwise classified; retriable.
    ProcessCrash,
    /// Security gate verdict other than allowed; no auto-retry.
    SecurityBlock,
    /// Attempts exceeded; terminal.
    Exhausted,
    /// Operator-initiated; terminal.
    Cancelled,
    /// Logic invariant violated; terminal, P1 alert.
    Internal,
}

impl FailureKind {
    /// Parses a failure kind from its string form.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidFailureKind` for unrecognized input.
    pub fn parse(s: &str) -> Result<Self, TaskError> {
        match s {
            "rate_limited" => Ok(Self::RateLimited),
            "network" => Ok(Self::Network),
            "resource" => Ok(Self::Resource),
            "process_hang" => Ok(Self::ProcessHang),
            "process_crash" => Ok(Self::ProcessCrash),
            "security_block" => Ok(Self::SecurityBlock),
            "exhausted" => Ok(Self::Exhausted),
            "cancelled" => Ok(Self::Cancelled),
            "internal" => Ok(Self::Internal),
            _ => Err(TaskError::InvalidFailureKind(s.to_string())),
        }
    }

    /// Returns the string representation of this failure kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Resource => "resource",
            Self::ProcessHang => "process_hang",
            Self::ProcessCrash => "process_crash",
            Self::SecurityBlock => "security_block",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Whether this failure consumes an attempt and may be retried.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Resource | Self::ProcessHang | Self::ProcessCrash
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Security scan verdict attached to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityVerdict {
    /// Not yet scanned.
    #[default]
    Unscanned,
    /// Scan passed; the command may run.
    Allowed,
    /// Scan blocked the command; operator review required.
    Blocked,
    /// Output masking replaced sensitive data during execution.
    Masked,
}

impl SecurityVerdict {
    /// Returns the string representation of this verdict.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unscanned => "unscanned",
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
            Self::Masked => "masked",
        }
    }

    /// Parses a verdict from its string form; unknown input maps to
    /// `Unscanned`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "allowed" => Self::Allowed,
            "blocked" => Self::Blocked,
            "masked" => Self::Masked,
            _ => Self::Unscanned,
        }
    }
}

/// One entry in a task's error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// When the error was recorded.
    pub at: DateTime<Utc>,
    /// Failure classification at the time.
    pub kind: String,
    /// Masked error message.
    pub message: String,
}

/// Maximum error-history entries retained per task.
const MAX_ERROR_HISTORY: usize = 20;

/// The central entity: one unit of work for the agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque unique identifier, assigned at creation.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Human-readable description; the source of the generated command.
    pub description: String,

    /// The generated command string passed to the agent CLI.
    pub command: String,

    /// Complexity tier.
    pub class: TaskClass,

    /// Dispatch priority.
    pub priority: TaskPriority,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Attempts started so far.
    pub attempt_count: u32,

    /// Cap on attempts before the task fails as exhausted.
    pub max_attempts: u32,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,

    /// Time the current (or last) attempt started.
    pub started_at: Option<DateTime<Utc>>,

    /// Time the task reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,

    /// Identity of the worker holding the claim, if any.
    pub worker_id: Option<String>,

    /// Fencing token rotated on each claim. Worker-side mutations must
    /// present the token they were issued.
    pub claim_token: String,

    /// Last liveness stamp from the owning worker.
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// PID of the agent subprocess currently owned, if running.
    pub agent_pid: Option<u32>,

    /// Bounded ring of the most recent masked subprocess output.
    pub last_output_tail: String,

    /// Class-specific resume data, serialized.
    pub resume_blob: Option<String>,

    /// Security scan verdict.
    pub security_verdict: SecurityVerdict,

    /// Failure classification when the state is failure-ish.
    pub failure_kind: Option<FailureKind>,

    /// Earliest time the task may be claimed again.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Working directory override for the agent subprocess.
    pub working_dir: Option<String>,

    /// Extra environment for the agent subprocess.
    pub env: HashMap<String, String>,

    /// Free-form labels used by claim predicates and listing filters.
    pub tags: Vec<String>,

    /// Client-supplied idempotency key, if any.
    pub dedup_key: Option<String>,

    /// Most recent error message (masked).
    pub last_error: Option<String>,

    /// Bounded history of errors across attempts.
    pub error_history: Vec<ErrorEntry>,
}

impl Task {
    /// Whether another attempt is permitted.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts && !self.state.is_terminal()
    }

    /// Record an error, keeping the history bounded.
    pub fn add_error(&mut self, at: DateTime<Utc>, kind: FailureKind, message: impl Into<String>) {
        let message = message.into();
        self.last_error = Some(message.clone());
        self.error_history.push(ErrorEntry {
            at,
            kind: kind.as_str().to_string(),
            message,
        });
        if self.error_history.len() > MAX_ERROR_HISTORY {
            self.error_history.remove(0);
        }
    }
}

/// A task submission: what external submitters provide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Human-readable name.
    pub name: String,

    /// Description the command is generated from.
    pub description: String,

    /// Complexity tier.
    pub class: TaskClass,

    /// Dispatch priority.
    pub priority: TaskPriority,

    /// Working directory override.
    pub working_dir: Option<String>,

    /// Extra environment for the subprocess.
    pub env: HashMap<String, String>,

    /// Free-form labels.
    pub tags: Vec<String>,

    /// Client-supplied idempotency key.
    pub dedup_key: Option<String>,

    /// Pre-generated command. When absent the store's caller generates
    /// one from the description and class.
    pub command: Option<String>,

    /// Override for the attempt cap.
    pub max_attempts: Option<u32>,
}

impl TaskSpec {
    /// Create a new builder for `TaskSpec`.
    #[must_use]
    pub fn builder() -> TaskSpecBuilder {
        TaskSpecBuilder::default()
    }
}

/// Builder for `TaskSpec`.
#[derive(Debug, Default)]
pub struct TaskSpecBuilder {
    name: Option<String>,
    description: Option<String>,
    class: Option<TaskClass>,
    priority: Option<TaskPriority>,
    working_dir: Option<String>,
    env: HashMap<String, String>,
    tags: Vec<String>,
    dedup_key: Option<String>,
    command: Option<String>,
    max_attempts: Option<u32>,
}

impl TaskSpecBuilder {
    /// Set the task name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the task description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the task class.
    #[must_use]
    pub const fn class(mut self, class: TaskClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Set the dispatch priority.
    #[must_use]
    pub const fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the idempotency key.
    #[must_use]
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Set an explicit command, bypassing generation.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Override the attempt cap.
    #[must_use]
    pub const fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Build the `TaskSpec`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not set.
    #[must_use]
    pub fn build(self) -> TaskSpec {
        let name = self.name.expect("name is required");
        TaskSpec {
            description: self.description.unwrap_or_else(|| name.clone()),
            name,
            class: self.class.unwrap_or(TaskClass::Light),
            priority: self.priority.unwrap_or(TaskPriority::Normal),
            working_dir: self.working_dir,
            env: self.env,
            tags: self.tags,
            dedup_key: self.dedup_key,
            command: self.command,
            max_attempts: self.max_attempts,
        }
    }
}

/// A worker's heartbeat row in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker identity.
    pub id: String,

    /// OS process ID of the hosting daemon.
    pub pid: u32,

    /// Time the worker started.
    pub started_at: DateTime<Utc>,

    /// Last heartbeat.
    pub heartbeat_at: DateTime<Utc>,

    /// Task currently claimed, if any.
    pub current_task_id: Option<String>,

    /// PID of the agent subprocess currently owned, if any.
    pub agent_pid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::parse(state.as_str()).unwrap(), state);
        }
        assert!(TaskState::parse("bogus").is_err());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        for terminal in [TaskState::Completed, TaskState::Failed, TaskState::Cancelled] {
            assert!(terminal.is_terminal());
            for target in TaskState::ALL {
                assert!(
                    !terminal.can_transition_to(&target),
                    "{terminal} must not transition to {target}"
                );
            }
        }
    }

    #[test]
    fn test_cancellation_reaches_every_non_terminal_state() {
        for state in TaskState::ALL {
            if !state.is_terminal() {
                assert!(state.can_transition_to(&TaskState::Cancelled));
            }
        }
    }

    #[test]
    fn test_legal_processing_transitions() {
        let from = TaskState::Processing;
        for to in [
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Paused,
            TaskState::WaitingUnban,
            TaskState::Retrying,
            TaskState::NeedsHumanReview,
            TaskState::Pending,
        ] {
            assert!(from.can_transition_to(&to), "processing -> {to}");
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!TaskState::Pending.can_transition_to(&TaskState::Completed));
        assert!(!TaskState::Pending.can_transition_to(&TaskState::Retrying));
        assert!(!TaskState::WaitingUnban.can_transition_to(&TaskState::Processing));
        assert!(!TaskState::NeedsHumanReview.can_transition_to(&TaskState::Processing));
    }

    #[test]
    fn test_class_accepts_long_names() {
        assert_eq!(TaskClass::parse("lightweight").unwrap(), TaskClass::Light);
        assert_eq!(TaskClass::parse("medium_context").unwrap(), TaskClass::Medium);
        assert_eq!(TaskClass::parse("heavy_context").unwrap(), TaskClass::Heavy);
        assert_eq!(TaskClass::parse("heavy").unwrap(), TaskClass::Heavy);
        assert!(TaskClass::parse("gigantic").is_err());
    }

    #[test]
    fn test_priority_dispatch_rank() {
        assert!(TaskPriority::Urgent.dispatch_rank() < TaskPriority::High.dispatch_rank());
        assert!(TaskPriority::High.dispatch_rank() < TaskPriority::Normal.dispatch_rank());
        assert!(TaskPriority::Normal.dispatch_rank() < TaskPriority::Low.dispatch_rank());
    }

    #[test]
    fn test_failure_kind_retriability() {
        assert!(FailureKind::Network.is_retriable());
        assert!(FailureKind::ProcessHang.is_retriable());
        assert!(FailureKind::ProcessCrash.is_retriable());
        assert!(!FailureKind::SecurityBlock.is_retriable());
        assert!(!FailureKind::Exhausted.is_retriable());
        assert!(!FailureKind::RateLimited.is_retriable());
    }

    #[test]
    fn test_spec_builder_defaults() {
        let spec = TaskSpec::builder().name("inspect-logs").build();
        assert_eq!(spec.name, "inspect-logs");
        assert_eq!(spec.description, "inspect-logs");
        assert_eq!(spec.class, TaskClass::Light);
        assert_eq!(spec.priority, TaskPriority::Normal);
        assert!(spec.dedup_key.is_none());
    }

    #[test]
    fn test_error_history_is_bounded() {
        let mut task = sample_task();
        for i in 0..40 {
            task.add_error(Utc::now(), FailureKind::Network, format!("err {i}"));
        }
        assert_eq!(task.error_history.len(), MAX_ERROR_HISTORY);
        assert_eq!(task.last_error.as_deref(), Some("err 39"));
        // Oldest entries dropped first.
        assert_eq!(task.error_history[0].message, "err 20");
    }

    fn sample_task() -> Task {
        Task {
            id: new_task_id(),
            name: "t".to_string(),
            description: "t".to_string(),
            command: "true".to_string(),
            class: TaskClass::Light,
            priority: TaskPriority::Normal,
            state: TaskState::Pending,
            attempt_count: 0,
            max_attempts: 5,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            ended_at: None,
            worker_id: None,
            claim_token: new_claim_token(),
            heartbeat_at: None,
            agent_pid: None,
            last_output_tail: String::new(),
            resume_blob: None,
            security_verdict: SecurityVerdict::Unscanned,
            failure_kind: None,
            next_attempt_at: None,
            working_dir: None,
            env: HashMap::new(),
            tags: Vec::new(),
            dedup_key: None,
            last_error: None,
            error_history: Vec::new(),
        }
    }
}
