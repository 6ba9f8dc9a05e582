//! Resume payloads.
//!
//! What a task carries across attempts, by class: nothing for light
//! tasks, a tail of prior output for medium tasks, and a chunked
//! progress record for heavy tasks. Heavy chunk boundaries are recorded
//! during the first execution and frozen; later attempts only update
//! chunk statuses.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::task::TaskClass;

/// Resume errors.
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// The stored blob failed to deserialize.
    #[error("corrupt resume blob: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Status of one heavy-task chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Announced but not started.
    Pending,
    /// Work on the chunk has begun.
    InProgress,
    /// Chunk finished.
    Done,
}

/// One chunk's progress record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Stable identifier announced by the agent.
    pub chunk_id: String,

    /// Current status.
    pub status: ChunkStatus,

    /// Digest of the output produced for the chunk, set when it
    /// completes.
    pub digest: Option<String>,
}

/// Ordered chunk progress for a heavy task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkPlan {
    /// Chunks in announcement order.
    pub chunks: Vec<ChunkRecord>,

    /// Once frozen, the chunk set never changes; only statuses do.
    pub frozen: bool,
}

impl ChunkPlan {
    /// First chunk that is not done, if any.
    #[must_use]
    pub fn first_incomplete(&self) -> Option<&str> {
        self.chunks
            .iter()
            .find(|c| c.status != ChunkStatus::Done)
            .map(|c| c.chunk_id.as_str())
    }

    /// Identifiers of completed chunks, in order.
    #[must_use]
    pub fn completed(&self) -> Vec<&str> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Done)
            .map(|c| c.chunk_id.as_str())
            .collect()
    }

    /// Freeze the chunk set. Boundaries observed in the first execution
    /// are final.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut ChunkRecord> {
        self.chunks.iter_mut().find(|c| c.chunk_id == id)
    }
}

/// Chunk marker scanner fed with subprocess output lines.
///
/// Recognizes `[[chunk:<id>:start]]` and `[[chunk:<id>:done]]` markers,
/// digesting the output between them.
pub struct ChunkTracker {
    plan: ChunkPlan,
    marker: Regex,
    current: Option<(String, Sha256)>,
}

impl ChunkTracker {
    /// Start tracking against an existing plan (or an empty one on the
    /// first attempt).
    #[must_use]
    pub fn new(plan: ChunkPlan) -> Self {
        Self {
            plan,
            marker: Regex::new(r"\[\[chunk:([A-Za-z0-9_.-]+):(start|done)\]\]")
                .expect("chunk marker pattern is valid"),
            current: None,
        }
    }

    /// Feed one output line; updates chunk state when it carries a marker.
    pub fn observe(&mut self, line: &str) {
        if let Some((_, hasher)) = &mut self.current {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }

        for caps in self.marker.captures_iter(line) {
            let id = &caps[1];
            match &caps[2] {
                "start" => {
                    if self.plan.find_mut(id).is_none() {
                        if self.plan.frozen {
                            // Unknown chunks after the freeze are ignored.
                            continue;
                        }
                        self.plan.chunks.push(ChunkRecord {
                            chunk_id: id.to_string(),
                            status: ChunkStatus::Pending,
                            digest: None,
                        });
                    }
                    if let Some(chunk) = self.plan.find_mut(id) {
                        if chunk.status == ChunkStatus::Pending {
                            chunk.status = ChunkStatus::InProgress;
                        }
                    }
                    self.current = Some((id.to_string(), Sha256::new()));
                }
                _ => {
                    let digest = match self.current.take() {
                        Some((current_id, hasher)) if current_id == id => {
                            Some(format!("{:x}", hasher.finalize()))
                        }
                        other => {
                            self.current = other;
                            None
                        }
                    };
                    if self.plan.frozen && self.plan.find_mut(id).is_none() {
                        continue;
                    }
                    if self.plan.find_mut(id).is_none() {
                        self.plan.chunks.push(ChunkRecord {
                            chunk_id: id.to_string(),
                            status: ChunkStatus::Pending,
                            digest: None,
                        });
                    }
                    if let Some(chunk) = self.plan.find_mut(id) {
                        chunk.status = ChunkStatus::Done;
                        if digest.is_some() {
                            chunk.digest = digest;
                        }
                    }
                }
            }
        }
    }

    /// Finish the attempt: freeze the plan and return it.
    #[must_use]
    pub fn into_plan(mut self) -> ChunkPlan {
        self.plan.freeze();
        self.plan
    }

    /// A read-only view of the plan mid-attempt.
    #[must_use]
    pub const fn plan(&self) -> &ChunkPlan {
        &self.plan
    }
}

/// Class-specific resume payload carried in `resume_blob`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResumePayload {
    /// Last lines of prior output, prepended as context.
    Context {
        /// The retained output lines.
        lines: Vec<String>,
    },
    /// Frozen chunk progress.
    Chunks {
        /// The plan.
        plan: ChunkPlan,
    },
}

impl ResumePayload {
    /// Build the payload to persist after an interrupted attempt.
    ///
    /// Light tasks carry nothing and retry from scratch.
    #[must_use]
    pub fn for_attempt(
        class: TaskClass,
        output_tail: &str,
        context_lines: usize,
        chunk_plan: Option<ChunkPlan>,
    ) -> Option<Self> {
        match class {
            TaskClass::Light => None,
            TaskClass::Medium => {
                let lines: Vec<String> = output_tail.lines().map(String::from).collect();
                let start = lines.len().saturating_sub(context_lines);
                Some(Self::Context {
                    lines: lines[start..].to_vec(),
                })
            }
            TaskClass::Heavy => chunk_plan.map(|plan| Self::Chunks { plan }),
        }
    }

    /// Serialize for the store.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_blob(&self) -> Result<String, ResumeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is corrupt.
    pub fn from_blob(blob: &str) -> Result<Self, ResumeError> {
        Ok(serde_json::from_str(blob)?)
    }

    /// Render the context prepended to the next attempt's prompt.
    #[must_use]
    pub fn preamble(&self) -> String {
        match self {
            Self::Context { lines } => {
                let mut text = String::from(
                    "=== TASK RESUME CONTEXT ===\nOutput from the interrupted attempt (tail):\n",
                );
                for line in lines {
                    text.push_str(line);
                    text.push('\n');
                }
                text.push_str(
                    "=== END RESUME CONTEXT ===\nContinue from where the task was interrupted. \
                     Avoid repeating previous outputs or actions. Check current file state \
                     before proceeding.",
                );
                text
            }
            Self::Chunks { plan } => {
                let done = plan.completed();
                let mut text = String::from("=== TASK RESUME CONTEXT ===\n");
                if done.is_empty() {
                    text.push_str("No chunks completed yet.\n");
                } else {
                    text.push_str(&format!("Chunks already complete: {}.\n", done.join(", ")));
                }
                if let Some(next) = plan.first_incomplete() {
                    text.push_str(&format!(
                        "Resume from chunk {next}. Do not redo completed chunks; keep the \
                         chunk identifiers from the previous attempt."
                    ));
                } else {
                    text.push_str("All recorded chunks are complete; verify and finish up.");
                }
                text
            }
        }
    }
}

/// Inject resume context into a generated agent command.
///
/// The generated commands carry their prompt as the first single-quoted
/// argument after `-p`; the context is spliced into the front of that
/// prompt. Commands without the marker are returned unchanged.
#[must_use]
pub fn rewrite_command(command: &str, preamble: &str) -> String {
    const MARKER: &str = "-p '";
    let Some(pos) = command.find(MARKER) else {
        return command.to_string();
    };
    let insert_at = pos + MARKER.len();
    let escaped = preamble.replace('\'', r"'\''");
    format!(
        "{}{}\n\n{}",
        &command[..insert_at],
        escaped,
        &command[insert_at..]
    )
}
