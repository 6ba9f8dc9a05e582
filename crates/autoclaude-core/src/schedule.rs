//! Periodic submission schedules.
//!
//! Schedules live in the user's crontab. Every managed entry is a pair of
//! lines: a sentinel comment identifying it as ours, then the cron line
//! that invokes the submission CLI. Disabled entries keep their slot with
//! the cron line commented out, so re-enabling restores them verbatim.

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

/// Sentinel prefix marking a core-managed crontab entry.
pub const SENTINEL_PREFIX: &str = "# AUTO_CLAUDE_TASK:";

/// Prefix of a disabled entry's cron line.
const DISABLED_PREFIX: &str = "# DISABLED: ";

/// Schedule errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The cron expression does not validate.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// No managed entry with the given ID.
    #[error("schedule not found: {0}")]
    NotFound(String),

    /// The crontab could not be read or written.
    #[error("crontab unavailable: {0}")]
    Crontab(String),
}

/// One managed schedule entry.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Stable identifier.
    pub id: String,

    /// Human-readable name (also carried in the sentinel).
    pub name: String,

    /// The five-field cron expression.
    pub cron_expr: String,

    /// The submission command the entry runs.
    pub command: String,

    /// Whether the entry is active.
    pub enabled: bool,

    /// Creation time recorded in the sentinel.
    pub created_at: DateTime<Utc>,
}

/// Access to the crontab. The system implementation shells out to
/// `crontab`; tests swap an in-memory fake.
pub trait CrontabBackend: Send + Sync {
    /// Read the full crontab content.
    ///
    /// # Errors
    ///
    /// Returns an error if the crontab cannot be read.
    fn read(&self) -> Result<String, ScheduleError>;

    /// Replace the full crontab content.
    ///
    /// # Errors
    ///
    /// Returns an error if the crontab cannot be written.
    fn write(&self, content: &str) -> Result<(), ScheduleError>;
}

/// Backend shelling out to the system `crontab` binary.
#[derive(Debug, Default)]
pub struct SystemCrontab;

impl CrontabBackend for SystemCrontab {
    fn read(&self) -> Result<String, ScheduleError> {
        let output = std::process::Command::new("crontab")
            .arg("-l")
            .output()
            .map_err(|e| ScheduleError::Crontab(e.to_string()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // An empty crontab is not an error.
            if stderr.contains("no crontab for") {
                Ok(String::new())
            } else {
                Err(ScheduleError::Crontab(stderr.into_owned()))
            }
        }
    }

    fn write(&self, content: &str) -> Result<(), ScheduleError> {
        use std::io::Write;
        use std::process::Stdio;

        let mut child = std::process::Command::new("crontab")
            .arg("-")
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ScheduleError::Crontab(e.to_string()))?;
        child
            .stdin
            .take()
            .ok_or_else(|| ScheduleError::Crontab("no stdin handle".to_string()))?
            .write_all(content.as_bytes())
            .map_err(|e| ScheduleError::Crontab(e.to_string()))?;
        let output = child
            .wait_with_output()
            .map_err(|e| ScheduleError::Crontab(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ScheduleError::Crontab(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }
}

/// Manager for core-owned crontab entries.
pub struct ScheduleManager<B: CrontabBackend> {
    backend: B,
    sentinel: Regex,
}

impl<B: CrontabBackend> ScheduleManager<B> {
    /// Create a manager over the given backend.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            sentinel: Regex::new(
                r"^# AUTO_CLAUDE_TASK:(\S+) - (.*) \(created: ([0-9T:.+Z-]+)\)$",
            )
            .expect("sentinel pattern is valid"),
        }
    }

    /// Add a schedule. Returns its ID.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid cron expression or crontab failure.
    pub fn add(
        &self,
        name: &str,
        cron_expr: &str,
        command: &str,
    ) -> Result<String, ScheduleError> {
        validate_cron(cron_expr)?;
        let id = format!("sched_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let created = Utc::now().to_rfc3339();

        let mut content = self.backend.read()?;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!(
            "{SENTINEL_PREFIX}{id} - {name} (created: {created})\n{cron_expr} {command}\n"
        ));
        self.backend.write(&content)?;
        Ok(id)
    }

    /// List all managed entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the crontab cannot be read.
    pub fn list(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let content = self.backend.read()?;
        let lines: Vec<&str> = content.lines().collect();
        let mut entries = Vec::new();

        let mut i = 0;
        while i < lines.len() {
            if let Some(caps) = self.sentinel.captures(lines[i]) {
                let Some(raw) = lines.get(i + 1) else { break };
                let (enabled, rest) = match raw.strip_prefix(DISABLED_PREFIX) {
                    Some(rest) => (false, rest),
                    None => (true, *raw),
                };
                if let Some((cron_expr, command)) = split_cron_line(rest) {
                    entries.push(ScheduleEntry {
                        id: caps[1].to_string(),
                        name: caps[2].to_string(),
                        cron_expr,
                        command,
                        enabled,
                        created_at: DateTime::parse_from_rfc3339(&caps[3])
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_default(),
                    });
                }
                i += 2;
            } else {
                i += 1;
            }
        }
        Ok(entries)
    }

    /// Remove a managed entry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no entry carries the ID.
    pub fn remove(&self, id: &str) -> Result<(), ScheduleError> {
        self.rewrite(id, |_sentinel, _cron| None)
    }

    /// Disable an entry without removing it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no entry carries the ID.
    pub fn disable(&self, id: &str) -> Result<(), ScheduleError> {
        self.rewrite(id, |sentinel, cron| {
            let cron = if cron.starts_with(DISABLED_PREFIX) {
                cron.to_string()
            } else {
                format!("{DISABLED_PREFIX}{cron}")
            };
            Some((sentinel.to_string(), cron))
        })
    }

    /// Re-enable a disabled entry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no entry carries the ID.
    pub fn enable(&self, id: &str) -> Result<(), ScheduleError> {
        self.rewrite(id, |sentinel, cron| {
            let cron = cron.strip_prefix(DISABLED_PREFIX).unwrap_or(cron);
            Some((sentinel.to_string(), cron.to_string()))
        })
    }

    /// Rewrite the entry with the given ID through `edit`; `None` deletes
    /// the pair of lines.
    fn rewrite(
        &self,
        id: &str,
        edit: impl Fn(&str, &str) -> Option<(String, String)>,
    ) -> Result<(), ScheduleError> {
        let content = self.backend.read()?;
        let lines: Vec<&str> = content.lines().collect();
        let mut out: Vec<String> = Vec::with_capacity(lines.len());
        let mut found = false;

        let mut i = 0;
        while i < lines.len() {
            let matches_id = self
                .sentinel
                .captures(lines[i])
                .is_some_and(|caps| &caps[1] == id);
            if matches_id {
                found = true;
                let cron = lines.get(i + 1).copied().unwrap_or("");
                if let Some((sentinel, cron)) = edit(lines[i], cron) {
                    out.push(sentinel);
                    out.push(cron);
                }
                i += 2;
            } else {
                out.push(lines[i].to_string());
                i += 1;
            }
        }

        if !found {
            return Err(ScheduleError::NotFound(id.to_string()));
        }
        let mut content = out.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        self.backend.write(&content)
    }
}

/// Split a cron line into its five-field expression and the command.
fn split_cron_line(line: &str) -> Option<(String, String)> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(5);
    for _ in 0..5 {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() {
        return None;
    }
    Some((fields.join(" "), rest.to_string()))
}

/// Validate a five-field cron expression.
///
/// # Errors
///
/// Returns `InvalidCron` if the expression does not have five fields in
/// range.
pub fn validate_cron(expr: &str) -> Result<(), ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ScheduleError::InvalidCron(expr.to_string()));
    }
    let ranges: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 7)];
    for (field, (lo, hi)) in fields.iter().zip(ranges) {
        if !validate_cron_field(field, lo, hi) {
            return Err(ScheduleError::InvalidCron(expr.to_string()));
        }
    }
    Ok(())
}

fn validate_cron_field(field: &str, lo: u32, hi: u32) -> bool {
    if field == "*" {
        return true;
    }
    // Step syntax: */n or a-b/n.
    let (base, step) = match field.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (field, None),
    };
    if let Some(step) = step {
        if step.parse::<u32>().map_or(true, |s| s == 0) {
            return false;
        }
        if base == "*" {
            return true;
        }
    }
    base.split(',').all(|part| match part.split_once('-') {
        Some((a, b)) => {
            matches!((a.parse::<u32>(), b.parse::<u32>()),
                (Ok(a), Ok(b)) if a >= lo && b <= hi && a <= b)
        }
        None => matches!(part.parse::<u32>(), Ok(v) if v >= lo && v <= hi),
    })
}
