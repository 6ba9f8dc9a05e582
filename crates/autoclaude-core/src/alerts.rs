//! Operational alerts.
//!
//! Alerts are appended to `logs/alerts.jsonl`, one JSON object per line,
//! and mirrored to the tracing log at a level matching their severity.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    /// Business interruption.
    P1,
    /// Recoverable failure.
    P2,
    /// Minor issue.
    P3,
}

/// One alert entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert ID.
    pub id: String,

    /// Severity.
    pub level: AlertLevel,

    /// Short title.
    pub title: String,

    /// Detail message.
    pub message: String,

    /// Related task, if any.
    pub task_id: Option<String>,

    /// Related worker, if any.
    pub worker_id: Option<String>,

    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Append-only alert sink.
pub struct AlertSink {
    path: PathBuf,
}

impl AlertSink {
    /// Create a sink writing to the given file.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Emit an alert. Failures to persist are logged and swallowed:
    /// alerting must never take the supervisor down.
    pub fn emit(
        &self,
        level: AlertLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        task_id: Option<&str>,
        worker_id: Option<&str>,
    ) -> Alert {
        let alert = Alert {
            id: format!("alert_{}", &Uuid::new_v4().simple().to_string()[..8]),
            level,
            title: title.into(),
            message: message.into(),
            task_id: task_id.map(String::from),
            worker_id: worker_id.map(String::from),
            created_at: Utc::now(),
        };

        match level {
            AlertLevel::P1 => error!(title = %alert.title, "{}", alert.message),
            AlertLevel::P2 => warn!(title = %alert.title, "{}", alert.message),
            AlertLevel::P3 => info!(title = %alert.title, "{}", alert.message),
        }

        if let Err(e) = self.append(&alert) {
            warn!("failed to persist alert {}: {e}", alert.id);
        }
        alert
    }

    fn append(&self, alert: &Alert) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(alert).map_err(std::io::Error::other)?;
        writeln!(file, "{line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alerts_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AlertSink::new(dir.path().join("alerts.jsonl"));

        sink.emit(AlertLevel::P2, "task failed", "boom", Some("task_1"), None);
        sink.emit(AlertLevel::P3, "recovered", "ok", None, Some("worker_0"));

        let raw = std::fs::read_to_string(dir.path().join("alerts.jsonl")).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Alert = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.level, AlertLevel::P2);
        assert_eq!(first.task_id.as_deref(), Some("task_1"));
    }
}
