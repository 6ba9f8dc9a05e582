//! `SQLite`-backed task store.
//!
//! The store is the single source of truth. It provides atomic, serialized
//! state transitions: claims rotate a fencing token, worker-side mutations
//! must present the token they were issued, and compare-and-set
//! transitions reject any request whose precondition no longer holds.
//! A lost race is an error the caller can treat as a no-op.

// SQLite stores counts and spans as i64; values never approach the edges.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::clock::{Clock, SharedClock, SystemClock};
use crate::gate::{SecurityFinding, Severity};
use crate::task::{
    new_claim_token, new_task_id, ErrorEntry, FailureKind, SecurityVerdict, Task, TaskClass,
    TaskPriority, TaskSpec, TaskState, WorkerRecord,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON column (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task not found.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The unknown task ID.
        task_id: String,
    },

    /// A worker presented a stale or foreign claim token.
    #[error("stale claim on task {task_id}: token mismatch")]
    StaleClaim {
        /// Task whose claim was contested.
        task_id: String,
    },

    /// Compare-and-set precondition failed: the task is not in any of the
    /// expected states. Racing callers treat this as a no-op.
    #[error("transition conflict on task {task_id}: state is {actual}")]
    TransitionConflict {
        /// Task whose transition was rejected.
        task_id: String,
        /// State actually observed.
        actual: TaskState,
    },

    /// The requested transition is not legal in the state machine.
    #[error("illegal transition on task {task_id}: {from} -> {to}")]
    IllegalTransition {
        /// Task whose transition was rejected.
        task_id: String,
        /// Current state.
        from: TaskState,
        /// Requested state.
        to: TaskState,
    },

    /// A stored column failed to parse into its model type.
    #[error("corrupt row for task {task_id}: {detail}")]
    CorruptRow {
        /// Task with the corrupt row.
        task_id: String,
        /// What failed to parse.
        detail: String,
    },
}

/// Claim predicate: the classes a worker may take, each with the per-class
/// concurrency cap currently in force.
#[derive(Debug, Clone)]
pub struct ClaimPredicate {
    /// `(class, cap)` pairs. A class at or over its cap is skipped.
    pub classes: Vec<(TaskClass, usize)>,
}

impl ClaimPredicate {
    /// Predicate allowing every class with the given uniform cap.
    #[must_use]
    pub fn all_classes(cap: usize) -> Self {
        Self {
            classes: vec![
                (TaskClass::Light, cap),
                (TaskClass::Medium, cap),
                (TaskClass::Heavy, cap),
            ],
        }
    }
}

/// Worker-fenced mutation: the subset of fields a worker may patch while
/// it holds the claim.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    /// Append masked output to the bounded tail.
    pub tail_append: Option<String>,

    /// Cap on the stored tail, in bytes. Older output is dropped first.
    pub tail_limit: Option<usize>,

    /// Replace the resume blob (`Some(None)` clears it).
    pub resume_blob: Option<Option<String>>,

    /// Record the agent subprocess PID (`Some(None)` clears it).
    pub agent_pid: Option<Option<u32>>,

    /// Update the security verdict.
    pub security_verdict: Option<SecurityVerdict>,
}

/// State-transition side effects applied atomically with the CAS.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    /// Set the failure kind (`Some(None)` clears it).
    pub failure_kind: Option<Option<FailureKind>>,

    /// Record an error message under the given kind.
    pub error: Option<(FailureKind, String)>,

    /// Earliest time of the next claim (`Some(None)` clears it).
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,

    /// Release the worker claim and rotate the fencing token.
    pub release_claim: bool,

    /// Refund the attempt the current claim consumed. Used when a
    /// rate-limit event suspends a task: such events consume no attempt.
    pub refund_attempt: bool,

    /// Replace the resume blob (`Some(None)` clears it). Used by the
    /// recovery loop when a dead worker left no payload behind.
    pub resume_blob: Option<Option<String>>,

    /// Update the security verdict.
    pub security_verdict: Option<SecurityVerdict>,
}

/// The durable task store.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    clock: SharedClock,
}

impl Store {
    /// Opens or creates a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    /// Opens a store with an injected clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open_with_clock(
        path: impl AsRef<Path>,
        clock: SharedClock,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    /// Creates an in-memory store with an injected clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory_with_clock(clock: SharedClock) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Inserts a new task in state `pending`.
    ///
    /// Idempotent on the optional `dedup_key`: re-submitting a spec whose
    /// key already exists returns the existing task's ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn submit(&self, spec: &TaskSpec) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();

        if let Some(key) = &spec.dedup_key {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM tasks WHERE dedup_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
        }

        let id = new_task_id();
        let now = ts(self.now());
        let command = spec
            .command
            .clone()
            .unwrap_or_else(|| spec.description.clone());

        conn.execute(
            "INSERT INTO tasks (id, name, description, command, class, priority, priority_rank,
                                state, attempt_count, max_attempts, created_at, updated_at,
                                claim_token, env, tags, dedup_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?10, ?11, ?12, ?13, ?14)",
            params![
                id,
                spec.name,
                spec.description,
                command,
                spec.class.as_str(),
                spec.priority.as_str(),
                spec.priority.dispatch_rank(),
                TaskState::Pending.as_str(),
                spec.max_attempts.unwrap_or(5),
                now,
                new_claim_token(),
                serde_json::to_string(&spec.env)?,
                serde_json::to_string(&spec.tags)?,
                spec.dedup_key,
            ],
        )?;

        // working_dir travels separately so the INSERT column list stays
        // within SQLite's bound-parameter comfort zone.
        if let Some(dir) = &spec.working_dir {
            conn.execute(
                "UPDATE tasks SET working_dir = ?1 WHERE id = ?2",
                params![dir, id],
            )?;
        }

        Ok(id)
    }

    /// Atomically claims the highest-priority ready pending task matching
    /// the predicate.
    ///
    /// The selected task transitions to `processing`, its fencing token
    /// rotates, and the attempt counter increments. Returns `None` when
    /// nothing is claimable.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying queries fail.
    pub fn claim(
        &self,
        worker_id: &str,
        predicate: &ClaimPredicate,
    ) -> Result<Option<(Task, String)>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = self.now();
        let now_s = ts(now);

        // Classes still under their concurrency cap.
        let mut allowed: Vec<&str> = Vec::new();
        for (class, cap) in &predicate.classes {
            let in_flight: i64 = tx.query_row(
                "SELECT COUNT(*) FROM tasks WHERE class = ?1 AND state IN ('processing', 'paused')",
                params![class.as_str()],
                |row| row.get(0),
            )?;
            if (in_flight as usize) < *cap {
                allowed.push(class.as_str());
            }
        }
        if allowed.is_empty() {
            return Ok(None);
        }

        let placeholders = allowed
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id FROM tasks
             WHERE state = 'pending'
               AND attempt_count < max_attempts
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
               AND class IN ({placeholders})
             ORDER BY priority_rank ASC, created_at ASC, id ASC
             LIMIT 1"
        );
        let mut sql_params: Vec<&dyn rusqlite::ToSql> = vec![&now_s];
        for class in &allowed {
            sql_params.push(class);
        }

        let picked: Option<String> = tx
            .query_row(&sql, sql_params.as_slice(), |row| row.get(0))
            .optional()?;
        let Some(task_id) = picked else {
            return Ok(None);
        };

        // A claim starts a fresh attempt: the output ring resets here and
        // is append-only until the attempt ends.
        let token = new_claim_token();
        tx.execute(
            "UPDATE tasks
             SET state = 'processing', worker_id = ?1, claim_token = ?2,
                 attempt_count = attempt_count + 1, started_at = ?3,
                 heartbeat_at = ?3, updated_at = ?3, failure_kind = NULL,
                 last_output_tail = ''
             WHERE id = ?4",
            params![worker_id, token, now_s, task_id],
        )?;

        let task = read_task(&tx, &task_id)?.ok_or(StoreError::NotFound {
            task_id: task_id.clone(),
        })?;
        tx.commit()?;
        Ok(Some((task, token)))
    }

    /// Applies a worker-side patch, fenced by the claim token.
    ///
    /// # Errors
    ///
    /// Returns `StaleClaim` if the token does not match the task's
    /// current claim.
    pub fn update_by_token(
        &self,
        task_id: &str,
        claim_token: &str,
        patch: &TaskPatch,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current: Option<(String, String, String)> = tx
            .query_row(
                "SELECT claim_token, state, last_output_tail FROM tasks WHERE id = ?1",
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((token, state, tail)) = current else {
            return Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            });
        };
        let state = parse_state(task_id, &state)?;
        if token != claim_token || !state.is_claimed() {
            return Err(StoreError::StaleClaim {
                task_id: task_id.to_string(),
            });
        }

        let now_s = ts(self.now());

        if let Some(chunk) = &patch.tail_append {
            let mut tail = tail;
            tail.push_str(chunk);
            if let Some(limit) = patch.tail_limit {
                if tail.len() > limit {
                    let cut = tail.len() - limit;
                    // Trim at a character boundary at or after the cut.
                    let boundary = (cut..tail.len())
                        .find(|i| tail.is_char_boundary(*i))
                        .unwrap_or(tail.len());
                    tail.drain(..boundary);
                }
            }
            tx.execute(
                "UPDATE tasks SET last_output_tail = ?1, updated_at = ?2 WHERE id = ?3",
                params![tail, now_s, task_id],
            )?;
        }
        if let Some(blob) = &patch.resume_blob {
            tx.execute(
                "UPDATE tasks SET resume_blob = ?1, updated_at = ?2 WHERE id = ?3",
                params![blob, now_s, task_id],
            )?;
        }
        if let Some(pid) = patch.agent_pid {
            tx.execute(
                "UPDATE tasks SET agent_pid = ?1, updated_at = ?2 WHERE id = ?3",
                params![pid, now_s, task_id],
            )?;
        }
        if let Some(verdict) = patch.security_verdict {
            tx.execute(
                "UPDATE tasks SET security_verdict = ?1, updated_at = ?2 WHERE id = ?3",
                params![verdict.as_str(), now_s, task_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Compare-and-set state transition.
    ///
    /// Rejects the request if the current state is not in `from_set`
    /// (`TransitionConflict`) or the transition is not legal in the state
    /// machine (`IllegalTransition`). Terminal states are unreachable as
    /// sources because no legal transition leaves them.
    ///
    /// # Errors
    ///
    /// See above; also any underlying database error.
    pub fn transition(
        &self,
        task_id: &str,
        from_set: &[TaskState],
        to: TaskState,
        patch: &TransitionPatch,
    ) -> Result<Task, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = self.now();
        let now_s = ts(now);

        let current = read_task(&tx, task_id)?.ok_or_else(|| StoreError::NotFound {
            task_id: task_id.to_string(),
        })?;
        if !from_set.contains(&current.state) {
            return Err(StoreError::TransitionConflict {
                task_id: task_id.to_string(),
                actual: current.state,
            });
        }
        if !current.state.can_transition_to(&to) {
            return Err(StoreError::IllegalTransition {
                task_id: task_id.to_string(),
                from: current.state,
                to,
            });
        }

        tx.execute(
            "UPDATE tasks SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![to.as_str(), now_s, task_id],
        )?;
        if to.is_terminal() {
            tx.execute(
                "UPDATE tasks SET ended_at = ?1, worker_id = NULL, agent_pid = NULL,
                                  claim_token = ?2
                 WHERE id = ?3",
                params![now_s, new_claim_token(), task_id],
            )?;
        } else if patch.release_claim {
            tx.execute(
                "UPDATE tasks SET worker_id = NULL, agent_pid = NULL, claim_token = ?1
                 WHERE id = ?2",
                params![new_claim_token(), task_id],
            )?;
        }
        if patch.refund_attempt {
            tx.execute(
                "UPDATE tasks SET attempt_count = MAX(attempt_count - 1, 0) WHERE id = ?1",
                params![task_id],
            )?;
        }
        if let Some(kind) = patch.failure_kind {
            tx.execute(
                "UPDATE tasks SET failure_kind = ?1 WHERE id = ?2",
                params![kind.map(|k| k.as_str()), task_id],
            )?;
        }
        if let Some(at) = patch.next_attempt_at {
            tx.execute(
                "UPDATE tasks SET next_attempt_at = ?1 WHERE id = ?2",
                params![at.map(ts), task_id],
            )?;
        }
        if let Some(verdict) = patch.security_verdict {
            tx.execute(
                "UPDATE tasks SET security_verdict = ?1 WHERE id = ?2",
                params![verdict.as_str(), task_id],
            )?;
        }
        if let Some(blob) = &patch.resume_blob {
            tx.execute(
                "UPDATE tasks SET resume_blob = ?1 WHERE id = ?2",
                params![blob, task_id],
            )?;
        }
        if let Some((kind, message)) = &patch.error {
            let mut history: Vec<ErrorEntry> =
                serde_json::from_str(&read_text(&tx, task_id, "error_history")?)?;
            history.push(ErrorEntry {
                at: now,
                kind: kind.as_str().to_string(),
                message: message.clone(),
            });
            if history.len() > 20 {
                history.remove(0);
            }
            tx.execute(
                "UPDATE tasks SET last_error = ?1, error_history = ?2 WHERE id = ?3",
                params![message, serde_json::to_string(&history)?, task_id],
            )?;
        }

        let task = read_task(&tx, task_id)?.ok_or_else(|| StoreError::NotFound {
            task_id: task_id.to_string(),
        })?;
        tx.commit()?;
        Ok(task)
    }

    /// Records a submission-time scan verdict on an unclaimed task.
    ///
    /// Orchestrator-side mutation; worker-held tasks update their verdict
    /// through the fenced patch instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the task does not exist.
    pub fn mark_scanned(
        &self,
        task_id: &str,
        verdict: SecurityVerdict,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE tasks SET security_verdict = ?1, updated_at = ?2 WHERE id = ?3",
            params![verdict.as_str(), ts(self.now()), task_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    /// Updates worker liveness, and the claimed task's heartbeat when one
    /// is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub fn heartbeat(
        &self,
        worker_id: &str,
        pid: u32,
        task: Option<(&str, Option<u32>)>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let now_s = ts(self.now());
        let (task_id, agent_pid) = match task {
            Some((id, agent)) => (Some(id.to_string()), agent),
            None => (None, None),
        };

        conn.execute(
            "INSERT INTO workers (id, pid, started_at, heartbeat_at, current_task_id, agent_pid)
             VALUES (?1, ?2, ?3, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 pid = excluded.pid,
                 heartbeat_at = excluded.heartbeat_at,
                 current_task_id = excluded.current_task_id,
                 agent_pid = excluded.agent_pid",
            params![worker_id, pid, now_s, task_id, agent_pid],
        )?;

        if let Some(id) = task_id {
            conn.execute(
                "UPDATE tasks SET heartbeat_at = ?1 WHERE id = ?2 AND worker_id = ?3",
                params![now_s, id, worker_id],
            )?;
        }
        Ok(())
    }

    /// Read-only scan of tasks in the given states.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn sweep(&self, states: &[TaskState]) -> Result<Vec<Task>, StoreError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = states
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id FROM tasks WHERE state IN ({placeholders}) ORDER BY created_at ASC"
        );
        let state_strs: Vec<&str> = states.iter().map(TaskState::as_str).collect();
        let sql_params: Vec<&dyn rusqlite::ToSql> = state_strs
            .iter()
            .map(|s| s as &dyn rusqlite::ToSql)
            .collect();

        let ids: Vec<String> = conn
            .prepare(&sql)?
            .query_map(sql_params.as_slice(), |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        ids.iter()
            .map(|id| {
                read_task(&conn, id)?.ok_or_else(|| StoreError::NotFound {
                    task_id: id.clone(),
                })
            })
            .collect()
    }

    /// Fetches a task by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().unwrap();
        read_task(&conn, task_id)
    }

    /// Lists the most recently created tasks, optionally filtered by state.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(
        &self,
        states: Option<&[TaskState]>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        match states {
            Some(states) => {
                let mut tasks = self.sweep(states)?;
                tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                tasks.truncate(limit);
                Ok(tasks)
            }
            None => {
                let ids: Vec<String> = {
                    let conn = self.conn.lock().unwrap();
                    let mut stmt = conn.prepare(
                        "SELECT id FROM tasks ORDER BY created_at DESC, id DESC LIMIT ?1",
                    )?;
                    let ids = stmt
                        .query_map(params![limit as i64], |row| row.get(0))?
                        .collect::<Result<_, _>>()?;
                    ids
                };
                let conn = self.conn.lock().unwrap();
                ids.iter()
                    .map(|id| {
                        read_task(&conn, id)?.ok_or_else(|| StoreError::NotFound {
                            task_id: id.clone(),
                        })
                    })
                    .collect()
            }
        }
    }

    /// Task counts per state, for the queue gauges.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn counts_by_state(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut counts: BTreeMap<String, u64> = TaskState::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (state, count) = row?;
            counts.insert(state, count as u64);
        }
        Ok(counts)
    }

    /// Lists all worker heartbeat rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, pid, started_at, heartbeat_at, current_task_id, agent_pid
             FROM workers ORDER BY id",
        )?;
        let workers = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        workers
            .into_iter()
            .map(|(id, pid, started, beat, task, agent)| {
                Ok(WorkerRecord {
                    pid: pid as u32,
                    started_at: parse_ts(&id, &started)?,
                    heartbeat_at: parse_ts(&id, &beat)?,
                    current_task_id: task,
                    agent_pid: agent.map(|p| p as u32),
                    id,
                })
            })
            .collect()
    }

    /// Removes a worker's heartbeat row (worker declared dead).
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM workers WHERE id = ?1", params![worker_id])?;
        Ok(())
    }

    /// Persists security findings for audit.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn record_findings(
        &self,
        task_id: &str,
        findings: &[SecurityFinding],
    ) -> Result<(), StoreError> {
        if findings.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO findings (task_id, kind, span_start, span_end, severity,
                                       masked_value, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for finding in findings {
                stmt.execute(params![
                    task_id,
                    finding.kind,
                    finding.span.0 as i64,
                    finding.span.1 as i64,
                    severity_str(finding.severity),
                    finding.masked_value,
                    ts(finding.detected_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Loads the findings recorded for a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn findings_for(&self, task_id: &str) -> Result<Vec<SecurityFinding>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT kind, span_start, span_end, severity, masked_value, detected_at
             FROM findings WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(kind, start, end, severity, masked, detected)| {
                Ok(SecurityFinding {
                    task_id: Some(task_id.to_string()),
                    kind,
                    span: (start as usize, end as usize),
                    severity: parse_severity(&severity),
                    masked_value: masked,
                    detected_at: parse_ts(task_id, &detected)?,
                })
            })
            .collect()
    }

    /// Deletes terminal tasks whose end time is before `cutoff`.
    ///
    /// Returns the IDs removed so the caller can clean their directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletes fail.
    pub fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let cutoff_s = ts(cutoff);

        let ids: Vec<String> = tx
            .prepare(
                "SELECT id FROM tasks
                 WHERE state IN ('completed', 'failed', 'cancelled')
                   AND ended_at IS NOT NULL AND ended_at < ?1",
            )?
            .query_map(params![cutoff_s], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        for id in &ids {
            tx.execute("DELETE FROM findings WHERE task_id = ?1", params![id])?;
            tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(ids)
    }
}

/// Serialize a timestamp in fixed-width RFC 3339, so that SQL string
/// comparison agrees with time ordering.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(task_id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            task_id: task_id.to_string(),
            detail: format!("timestamp '{raw}': {e}"),
        })
}

fn severity_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn parse_severity(raw: &str) -> Severity {
    match raw {
        "critical" => Severity::Critical,
        "high" => Severity::High,
        "medium" => Severity::Medium,
        _ => Severity::Low,
    }
}

fn read_text(conn: &Connection, task_id: &str, column: &str) -> Result<String, StoreError> {
    // Column names come from call sites, never from input.
    let sql = format!("SELECT {column} FROM tasks WHERE id = ?1");
    Ok(conn.query_row(&sql, params![task_id], |row| row.get(0))?)
}

fn read_task(conn: &Connection, task_id: &str) -> Result<Option<Task>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, name, description, command, class, priority, state,
                    attempt_count, max_attempts, created_at, updated_at, started_at,
                    ended_at, worker_id, claim_token, heartbeat_at, agent_pid,
                    last_output_tail, resume_blob, security_verdict, failure_kind,
                    next_attempt_at, working_dir, env, tags, dedup_key, last_error,
                    error_history
             FROM tasks WHERE id = ?1",
            params![task_id],
            row_to_raw,
        )
        .optional()?;
    let Some(raw) = row else {
        return Ok(None);
    };
    Ok(Some(raw_to_task(raw)?))
}

/// Intermediate row tuple; converted into a `Task` outside the rusqlite
/// closure so model parse errors surface as `StoreError`.
type RawTask = (
    String,                 // id
    String,                 // name
    String,                 // description
    String,                 // command
    String,                 // class
    String,                 // priority
    String,                 // state
    i64,                    // attempt_count
    i64,                    // max_attempts
    String,                 // created_at
    String,                 // updated_at
    Option<String>,         // started_at
    Option<String>,         // ended_at
    Option<String>,         // worker_id
    String,                 // claim_token
    Option<String>,         // heartbeat_at
    Option<i64>,            // agent_pid
    String,                 // last_output_tail
    Option<String>,         // resume_blob
    String,                 // security_verdict
    Option<String>,         // failure_kind
    Option<String>,         // next_attempt_at
    Option<String>,         // working_dir
    String,                 // env
    String,                 // tags
    Option<String>,         // dedup_key
    Option<String>,         // last_error
    String,                 // error_history
);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
        row.get(18)?,
        row.get(19)?,
        row.get(20)?,
        row.get(21)?,
        row.get(22)?,
        row.get(23)?,
        row.get(24)?,
        row.get(25)?,
        row.get(26)?,
        row.get(27)?,
    ))
}

fn parse_state(task_id: &str, raw: &str) -> Result<TaskState, StoreError> {
    TaskState::parse(raw).map_err(|e| StoreError::CorruptRow {
        task_id: task_id.to_string(),
        detail: e.to_string(),
    })
}

fn raw_to_task(raw: RawTask) -> Result<Task, StoreError> {
    let (
        id,
        name,
        description,
        command,
        class,
        priority,
        state,
        attempt_count,
        max_attempts,
        created_at,
        updated_at,
        started_at,
        ended_at,
        worker_id,
        claim_token,
        heartbeat_at,
        agent_pid,
        last_output_tail,
        resume_blob,
        security_verdict,
        failure_kind,
        next_attempt_at,
        working_dir,
        env,
        tags,
        dedup_key,
        last_error,
        error_history,
    ) = raw;

    let corrupt = |detail: String| StoreError::CorruptRow {
        task_id: id.clone(),
        detail,
    };

    Ok(Task {
        name,
        description,
        command,
        class: TaskClass::parse(&class).map_err(|e| corrupt(e.to_string()))?,
        priority: TaskPriority::parse(&priority).map_err(|e| corrupt(e.to_string()))?,
        state: TaskState::parse(&state).map_err(|e| corrupt(e.to_string()))?,
        attempt_count: attempt_count as u32,
        max_attempts: max_attempts as u32,
        created_at: parse_ts(&id, &created_at)?,
        updated_at: parse_ts(&id, &updated_at)?,
        started_at: started_at.as_deref().map(|t| parse_ts(&id, t)).transpose()?,
        ended_at: ended_at.as_deref().map(|t| parse_ts(&id, t)).transpose()?,
        worker_id,
        claim_token,
        heartbeat_at: heartbeat_at
            .as_deref()
            .map(|t| parse_ts(&id, t))
            .transpose()?,
        agent_pid: agent_pid.map(|p| p as u32),
        last_output_tail,
        resume_blob,
        security_verdict: SecurityVerdict::parse(&security_verdict),
        failure_kind: failure_kind
            .as_deref()
            .map(FailureKind::parse)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?,
        next_attempt_at: next_attempt_at
            .as_deref()
            .map(|t| parse_ts(&id, t))
            .transpose()?,
        working_dir,
        env: serde_json::from_str(&env)?,
        tags: serde_json::from_str(&tags)?,
        dedup_key,
        last_error,
        error_history: serde_json::from_str(&error_history)?,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> Store {
        Store::in_memory().unwrap()
    }

    fn submit(store: &Store, name: &str) -> String {
        store
            .submit(&TaskSpec::builder().name(name).command("true").build())
            .unwrap()
    }

    #[test]
    fn test_submit_inserts_pending() {
        let store = store();
        let id = submit(&store, "a");
        let task = store.get(&id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.worker_id.is_none());
    }

    #[test]
    fn test_submit_dedup_key_is_idempotent() {
        let store = store();
        let spec = TaskSpec::builder()
            .name("nightly")
            .command("true")
            .dedup_key("nightly-2026-08-02")
            .build();
        let first = store.submit(&spec).unwrap();
        let second = store.submit(&spec).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_claim_orders_by_priority_then_age() {
        let store = store();
        let low = store
            .submit(
                &TaskSpec::builder()
                    .name("low")
                    .command("true")
                    .priority(TaskPriority::Low)
                    .build(),
            )
            .unwrap();
        let urgent = store
            .submit(
                &TaskSpec::builder()
                    .name("urgent")
                    .command("true")
                    .priority(TaskPriority::Urgent)
                    .build(),
            )
            .unwrap();

        let predicate = ClaimPredicate::all_classes(4);
        let (first, _) = store.claim("w0", &predicate).unwrap().unwrap();
        assert_eq!(first.id, urgent);
        let (second, _) = store.claim("w1", &predicate).unwrap().unwrap();
        assert_eq!(second.id, low);
        assert!(store.claim("w2", &predicate).unwrap().is_none());
    }

    #[test]
    fn test_claim_rotates_token_and_increments_attempt() {
        let store = store();
        let id = submit(&store, "a");
        let before = store.get(&id).unwrap().unwrap();
        let (task, token) = store
            .claim("w0", &ClaimPredicate::all_classes(1))
            .unwrap()
            .unwrap();
        assert_eq!(task.state, TaskState::Processing);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.worker_id.as_deref(), Some("w0"));
        assert_eq!(task.claim_token, token);
        assert_ne!(before.claim_token, token);
    }

    #[test]
    fn test_claim_respects_class_caps() {
        let store = store();
        submit(&store, "a");
        submit(&store, "b");

        let capped = ClaimPredicate {
            classes: vec![(TaskClass::Light, 1)],
        };
        assert!(store.claim("w0", &capped).unwrap().is_some());
        // Cap of one light task in flight: the second claim must wait.
        assert!(store.claim("w1", &capped).unwrap().is_none());
    }

    #[test]
    fn test_claim_honors_next_attempt_at() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Store::in_memory_with_clock(clock.clone()).unwrap();
        let id = submit(&store, "a");
        let (_, _) = store.claim("w0", &ClaimPredicate::all_classes(1)).unwrap().unwrap();
        store
            .transition(
                &id,
                &[TaskState::Processing],
                TaskState::Retrying,
                &TransitionPatch {
                    release_claim: true,
                    next_attempt_at: Some(Some(clock.now() + chrono::Duration::seconds(60))),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .transition(
                &id,
                &[TaskState::Retrying],
                TaskState::Pending,
                &TransitionPatch::default(),
            )
            .unwrap();

        assert!(store.claim("w0", &ClaimPredicate::all_classes(1)).unwrap().is_none());
        clock.advance_secs(61);
        assert!(store.claim("w0", &ClaimPredicate::all_classes(1)).unwrap().is_some());
    }

    #[test]
    fn test_update_by_token_rejects_stale_token() {
        let store = store();
        let id = submit(&store, "a");
        let (_, token) = store
            .claim("w0", &ClaimPredicate::all_classes(1))
            .unwrap()
            .unwrap();

        let patch = TaskPatch {
            tail_append: Some("hello\n".to_string()),
            ..Default::default()
        };
        store.update_by_token(&id, &token, &patch).unwrap();

        let result = store.update_by_token(&id, "not-the-token", &patch);
        assert!(matches!(result, Err(StoreError::StaleClaim { .. })));

        let task = store.get(&id).unwrap().unwrap();
        assert_eq!(task.last_output_tail, "hello\n");
    }

    #[test]
    fn test_tail_append_is_bounded() {
        let store = store();
        let id = submit(&store, "a");
        let (_, token) = store
            .claim("w0", &ClaimPredicate::all_classes(1))
            .unwrap()
            .unwrap();

        for i in 0..10 {
            store
                .update_by_token(
                    &id,
                    &token,
                    &TaskPatch {
                        tail_append: Some(format!("line {i}\n")),
                        tail_limit: Some(24),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        let task = store.get(&id).unwrap().unwrap();
        assert!(task.last_output_tail.len() <= 24);
        assert!(task.last_output_tail.contains("line 9"));
        assert!(!task.last_output_tail.contains("line 0"));
    }

    #[test]
    fn test_transition_cas_rejects_wrong_state() {
        let store = store();
        let id = submit(&store, "a");
        let result = store.transition(
            &id,
            &[TaskState::Processing],
            TaskState::Completed,
            &TransitionPatch::default(),
        );
        assert!(matches!(
            result,
            Err(StoreError::TransitionConflict {
                actual: TaskState::Pending,
                ..
            })
        ));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let store = store();
        let id = submit(&store, "a");
        store.claim("w0", &ClaimPredicate::all_classes(1)).unwrap();
        store
            .transition(
                &id,
                &[TaskState::Processing],
                TaskState::Completed,
                &TransitionPatch::default(),
            )
            .unwrap();

        let task = store.get(&id).unwrap().unwrap();
        assert!(task.ended_at.is_some());
        assert!(task.worker_id.is_none());

        // No from_set containing a terminal state can move it again.
        let result = store.transition(
            &id,
            &[TaskState::Completed],
            TaskState::Pending,
            &TransitionPatch::default(),
        );
        assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
    }

    #[test]
    fn test_refund_attempt_on_rate_limit() {
        let store = store();
        let id = submit(&store, "a");
        store.claim("w0", &ClaimPredicate::all_classes(1)).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().attempt_count, 1);

        store
            .transition(
                &id,
                &[TaskState::Processing],
                TaskState::WaitingUnban,
                &TransitionPatch {
                    refund_attempt: true,
                    release_claim: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().attempt_count, 0);
    }

    #[test]
    fn test_heartbeat_touches_worker_and_task() {
        let store = store();
        let id = submit(&store, "a");
        store.claim("w0", &ClaimPredicate::all_classes(1)).unwrap();

        store.heartbeat("w0", 1234, Some((&id, Some(4321)))).unwrap();
        let workers = store.list_workers().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].current_task_id.as_deref(), Some(&id[..]));
        assert_eq!(workers[0].agent_pid, Some(4321));
        assert!(store.get(&id).unwrap().unwrap().heartbeat_at.is_some());
    }

    #[test]
    fn test_counts_by_state() {
        let store = store();
        submit(&store, "a");
        submit(&store, "b");
        store.claim("w0", &ClaimPredicate::all_classes(1)).unwrap();

        let counts = store.counts_by_state().unwrap();
        assert_eq!(counts["pending"], 1);
        assert_eq!(counts["processing"], 1);
        assert_eq!(counts["completed"], 0);
    }

    #[test]
    fn test_findings_round_trip() {
        let store = store();
        let id = submit(&store, "a");
        let finding = SecurityFinding {
            task_id: None,
            kind: "destructive_fs".to_string(),
            span: (0, 8),
            severity: Severity::Critical,
            masked_value: None,
            detected_at: Utc::now(),
        };
        store.record_findings(&id, &[finding]).unwrap();

        let loaded = store.findings_for(&id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].kind, "destructive_fs");
        assert_eq!(loaded[0].severity, Severity::Critical);
        assert_eq!(loaded[0].task_id.as_deref(), Some(&id[..]));
    }

    #[test]
    fn test_purge_terminal_respects_grace() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Store::in_memory_with_clock(clock.clone()).unwrap();
        let id = submit(&store, "a");
        store.claim("w0", &ClaimPredicate::all_classes(1)).unwrap();
        store
            .transition(
                &id,
                &[TaskState::Processing],
                TaskState::Completed,
                &TransitionPatch::default(),
            )
            .unwrap();

        // Inside the grace period: nothing purged.
        let purged = store
            .purge_terminal(clock.now() - chrono::Duration::days(7))
            .unwrap();
        assert!(purged.is_empty());

        clock.advance_secs(8 * 24 * 3600);
        let purged = store
            .purge_terminal(clock.now() - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(purged, vec![id.clone()]);
        assert!(store.get(&id).unwrap().is_none());
    }
}
