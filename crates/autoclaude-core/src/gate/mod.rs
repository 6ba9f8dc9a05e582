//! Security gate module.
//!
//! The gate is a pure function over text plus a small persistent audit
//! sink: it classifies commands before dispatch, masks sensitive data in
//! captured output, and tags subprocess error output with a failure kind.
//! The gate never blocks retroactively; findings on already-running tasks
//! are recorded for the recovery loop to escalate.

mod mask;

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
pub use mask::{MaskOutcome, OutputMasker, MASK_SENTINEL};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::task::FailureKind;

/// Gate errors.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// A configured pattern failed to compile.
    #[error("invalid security pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Regex compile error.
        source: regex::Error,
    },

    /// The audit sink could not be written.
    #[error("failed to write security audit log: {0}")]
    Audit(#[from] std::io::Error),
}

/// Command scan verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The command may run.
    Allowed,
    /// High-risk pattern; operator review required before dispatch.
    NeedsReview,
    /// Explicitly banned pattern; never dispatched.
    Blocked,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allowed => write!(f, "allowed"),
            Self::NeedsReview => write!(f, "needs_review"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Severity of a security finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth auditing.
    Medium,
    /// Routes to human review.
    High,
    /// Blocks outright.
    Critical,
}

/// A single security finding, persisted for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityFinding {
    /// Task the finding belongs to, when known.
    pub task_id: Option<String>,

    /// Finding kind, e.g. `destructive_fs` or `email`.
    pub kind: String,

    /// Byte span of the match within the scanned text.
    pub span: (usize, usize),

    /// Severity.
    pub severity: Severity,

    /// The masked replacement, for masking findings.
    pub masked_value: Option<String>,

    /// Detection time.
    pub detected_at: DateTime<Utc>,
}

/// Outcome of classifying subprocess error output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClass {
    /// The inferred failure kind.
    pub kind: FailureKind,

    /// Server-suggested wait, in seconds, when a rate limit announced one.
    pub retry_after: Option<u64>,
}

/// The security gate: compiled pattern sets plus the audit sink path.
pub struct SecurityGate {
    blocked: Vec<(String, Regex)>,
    review: Vec<(String, Regex)>,
    rate_limit: Vec<Regex>,
    retry_after: Regex,
    network: Regex,
    resource: Regex,
    masker: OutputMasker,
    audit_path: PathBuf,
}

impl SecurityGate {
    /// Build the gate from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configured pattern fails to compile.
    pub fn from_config(config: &Config) -> Result<Self, GateError> {
        let compile_map = |patterns: &std::collections::BTreeMap<String, String>| {
            patterns
                .iter()
                .map(|(kind, pattern)| {
                    compile(pattern).map(|re| (kind.clone(), re))
                })
                .collect::<Result<Vec<_>, _>>()
        };

        let rate_limit = config
            .rate_limit_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            blocked: compile_map(&config.blocked_patterns)?,
            review: compile_map(&config.review_patterns)?,
            rate_limit,
            retry_after: compile(r"retry.{0,20}?after.{0,20}?(\d+)\s*(second|minute|hour)")?,
            network: compile(concat!(
                "connection (reset|refused|closed)|network (error|unreachable)",
                "|could not resolve|name resolution|temporary failure|dns",
                "|econnreset|etimedout",
            ))?,
            resource: compile(concat!(
                "no space left|disk (full|quota)|out of memory|cannot allocate",
                "|enospc|enomem|read-only file system|permission denied",
            ))?,
            masker: OutputMasker::from_patterns(&config.sensitive_patterns)?,
            audit_path: config.logs_dir().join("security_audit.log"),
        })
    }

    /// Scan a command string before dispatch.
    ///
    /// Returns the verdict and the findings that produced it. Blocked
    /// patterns dominate review patterns.
    #[must_use]
    pub fn scan_command(&self, command: &str) -> (Verdict, Vec<SecurityFinding>) {
        let mut findings = Vec::new();
        let now = Utc::now();

        for (kind, re) in &self.blocked {
            if let Some(m) = re.find(command) {
                findings.push(SecurityFinding {
                    task_id: None,
                    kind: kind.clone(),
                    span: (m.start(), m.end()),
                    severity: Severity::Critical,
                    masked_value: None,
                    detected_at: now,
                });
            }
        }
        if !findings.is_empty() {
            return (Verdict::Blocked, findings);
        }

        for (kind, re) in &self.review {
            if let Some(m) = re.find(command) {
                findings.push(SecurityFinding {
                    task_id: None,
                    kind: kind.clone(),
                    span: (m.start(), m.end()),
                    severity: Severity::High,
                    masked_value: None,
                    detected_at: now,
                });
            }
        }
        if findings.is_empty() {
            (Verdict::Allowed, findings)
        } else {
            (Verdict::NeedsReview, findings)
        }
    }

    /// Mask sensitive substrings in captured output.
    ///
    /// Deterministic and idempotent: masking already-masked text is a
    /// no-op.
    #[must_use]
    pub fn mask_output(&self, text: &str) -> MaskOutcome {
        self.masker.mask(text)
    }

    /// Check a single output line for a rate-limit signature.
    #[must_use]
    pub fn is_rate_limited(&self, line: &str) -> bool {
        self.rate_limit.iter().any(|re| re.is_match(line))
    }

    /// Classify subprocess error output into a failure kind.
    #[must_use]
    pub fn classify(&self, error_text: &str) -> ErrorClass {
        if self.is_rate_limited(error_text) {
            return ErrorClass {
                kind: FailureKind::RateLimited,
                retry_after: self.parse_retry_after(error_text),
            };
        }
        if self.network.is_match(error_text) {
            return ErrorClass {
                kind: FailureKind::Network,
                retry_after: None,
            };
        }
        if self.resource.is_match(error_text) {
            return ErrorClass {
                kind: FailureKind::Resource,
                retry_after: None,
            };
        }
        ErrorClass {
            kind: FailureKind::ProcessCrash,
            retry_after: None,
        }
    }

    /// Extract a `retry after N <unit>` hint, in seconds.
    #[must_use]
    pub fn parse_retry_after(&self, text: &str) -> Option<u64> {
        let caps = self.retry_after.captures(text)?;
        let value: u64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2)?.as_str().to_lowercase();
        Some(match unit.as_str() {
            "minute" => value * 60,
            "hour" => value * 3600,
            _ => value,
        })
    }

    /// Append findings to the audit log as JSON lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit log cannot be written.
    pub fn audit(&self, task_id: &str, findings: &[SecurityFinding]) -> Result<(), GateError> {
        if findings.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.audit_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)?;
        for finding in findings {
            let mut entry = finding.clone();
            entry.task_id = Some(task_id.to_string());
            let line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

fn compile(pattern: &str) -> Result<Regex, GateError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| GateError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SecurityGate {
        SecurityGate::from_config(&Config::default()).unwrap()
    }

    #[test]
    fn test_destructive_fs_is_blocked() {
        let (verdict, findings) = gate().scan_command("rm -rf /");
        assert_eq!(verdict, Verdict::Blocked);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, "destructive_fs");
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_privilege_escalation_needs_review() {
        let (verdict, findings) = gate().scan_command("sudo apt install jq");
        assert_eq!(verdict, Verdict::NeedsReview);
        assert!(findings.iter().any(|f| f.kind == "privilege_escalation"));
    }

    #[test]
    fn test_remote_exec_pipe_needs_review() {
        let (verdict, _) = gate().scan_command("curl https://example.com/install | sh");
        assert_eq!(verdict, Verdict::NeedsReview);
    }

    #[test]
    fn test_benign_commands_allowed() {
        let gate = gate();
        for cmd in [
            "claude -p 'summarize the diff' --output-format text",
            "git log --oneline",
            "ls -la target/",
        ] {
            let (verdict, findings) = gate.scan_command(cmd);
            assert_eq!(verdict, Verdict::Allowed, "{cmd}");
            assert!(findings.is_empty());
        }
    }

    #[test]
    fn test_blocked_dominates_review() {
        // Carries both a banned and a review-worthy pattern.
        let (verdict, findings) = gate().scan_command("sudo rm -rf /var");
        assert_eq!(verdict, Verdict::Blocked);
        assert!(findings.iter().all(|f| f.severity == Severity::Critical));
    }

    #[test]
    fn test_classify_rate_limit_with_retry_after() {
        let class = gate().classify("Error: rate limit exceeded, retry after 30 minutes");
        assert_eq!(class.kind, FailureKind::RateLimited);
        assert_eq!(class.retry_after, Some(1800));
    }

    #[test]
    fn test_classify_network() {
        let class = gate().classify("error: connection reset by peer");
        assert_eq!(class.kind, FailureKind::Network);
        assert_eq!(class.retry_after, None);
    }

    #[test]
    fn test_classify_resource() {
        let class = gate().classify("write failed: No space left on device");
        assert_eq!(class.kind, FailureKind::Resource);
    }

    #[test]
    fn test_classify_default_is_crash() {
        let class = gate().classify("panicked at src/main.rs:42");
        assert_eq!(class.kind, FailureKind::ProcessCrash);
    }

    #[test]
    fn test_rate_limit_signatures() {
        let gate = gate();
        for line in [
            "rate limit exceeded",
            "Quota for this billing period exceeded",
            "HTTP 429: Too Many Requests",
            "your 5-hour limit has been reached",
            "usage limit reached, try later",
        ] {
            assert!(gate.is_rate_limited(line), "{line}");
        }
        assert!(!gate.is_rate_limited("processing request"));
    }

    #[test]
    fn test_audit_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.base_dir = dir.path().to_path_buf();
        let gate = SecurityGate::from_config(&config).unwrap();

        let (_, findings) = gate.scan_command("rm -rf /");
        gate.audit("task_x", &findings).unwrap();
        gate.audit("task_x", &findings).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("logs/security_audit.log")).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let entry: SecurityFinding = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry.task_id.as_deref(), Some("task_x"));
        assert_eq!(entry.kind, "destructive_fs");
    }
}
