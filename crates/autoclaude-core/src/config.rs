//! Configuration module.
//!
//! A single typed configuration record with explicit defaults for every
//! recognized option. Unknown keys are rejected at load time so that a
//! typo in the config file fails fast instead of silently falling back
//! to a default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::task::TaskClass;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Config file could not be parsed (includes unknown keys).
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A recognized option carries an invalid value.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level configuration record.
///
/// Every field has a default; a missing config file yields
/// `Config::default()`. Unknown keys are a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base directory for all on-disk state.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Logical agent session length, used to clamp rate-limit backoff.
    #[serde(default = "default_session_limit")]
    pub session_limit_seconds: u64,

    /// Initial backoff applied on the first rate-limit hit.
    #[serde(default = "default_unban_wait")]
    pub default_unban_wait_seconds: u64,

    /// Exponential base for consecutive rate-limit hits.
    #[serde(default = "default_backoff_multiplier")]
    pub rate_limit_backoff_multiplier: f64,

    /// Free-disk threshold below which new dispatch halts.
    #[serde(default = "default_min_disk_space_gb")]
    pub min_disk_space_gb: u64,

    /// Memory usage percentage above which new dispatch halts.
    #[serde(default = "default_max_memory_percent")]
    pub max_memory_used_percent: f64,

    /// Number of concurrent workers.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Worker heartbeat period in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    /// Recovery loop period in seconds.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,

    /// Per-attempt cap on captured subprocess output.
    #[serde(default = "default_max_output_size")]
    pub max_output_size_bytes: u64,

    /// Maximum attempts before a task fails as exhausted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Grace between SIGTERM and SIGKILL on subprocess teardown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Lines of prior output carried as resume context for medium tasks.
    #[serde(default = "default_resume_context_lines")]
    pub resume_context_lines: usize,

    /// Days a terminal task is retained before the purge sweep removes it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Port for the Prometheus metrics endpoint.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Minimal agent invocation used to probe for rate-limit recovery.
    #[serde(default = "default_probe_command")]
    pub probe_command: String,

    /// Sensitive-data patterns masked from all captured output.
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,

    /// Patterns that cause a command to be blocked outright, keyed by the
    /// finding kind recorded in the audit log.
    #[serde(default = "default_blocked_patterns")]
    pub blocked_patterns: BTreeMap<String, String>,

    /// Patterns that route a command to human review, keyed by finding kind.
    #[serde(default = "default_review_patterns")]
    pub review_patterns: BTreeMap<String, String>,

    /// Signatures that identify a rate-limit response in agent output.
    #[serde(default = "default_rate_limit_patterns")]
    pub rate_limit_patterns: Vec<String>,

    /// Per-class wall-clock timeouts for the agent subprocess.
    #[serde(default)]
    pub agent_timeout_seconds: ClassTimeouts,

    /// Per-class concurrency caps. Absent classes default to `num_workers`.
    #[serde(default)]
    pub class_concurrency: BTreeMap<String, usize>,

    /// Tool allow-list per task class. Light must be a subset of Medium,
    /// Medium a subset of Heavy.
    #[serde(default = "default_tool_allowlist")]
    pub class_tool_allowlist: BTreeMap<String, Vec<String>>,
}

/// Per-class subprocess timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassTimeouts {
    /// Timeout for lightweight tasks.
    #[serde(default = "default_light_timeout")]
    pub light: u64,

    /// Timeout for medium-context tasks.
    #[serde(default = "default_medium_timeout")]
    pub medium: u64,

    /// Timeout for heavy-context tasks.
    #[serde(default = "default_heavy_timeout")]
    pub heavy: u64,
}

impl Default for ClassTimeouts {
    fn default() -> Self {
        Self {
            light: default_light_timeout(),
            medium: default_medium_timeout(),
            heavy: default_heavy_timeout(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

const fn default_session_limit() -> u64 {
    18_000
}

const fn default_unban_wait() -> u64 {
    3600
}

const fn default_backoff_multiplier() -> f64 {
    1.5
}

const fn default_min_disk_space_gb() -> u64 {
    5
}

const fn default_max_memory_percent() -> f64 {
    90.0
}

const fn default_num_workers() -> usize {
    2
}

const fn default_heartbeat_interval() -> u64 {
    30
}

const fn default_health_check_interval() -> u64 {
    60
}

const fn default_max_output_size() -> u64 {
    50 * 1024 * 1024
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_shutdown_grace() -> u64 {
    10
}

const fn default_resume_context_lines() -> usize {
    500
}

const fn default_retention_days() -> u32 {
    7
}

const fn default_metrics_port() -> u16 {
    8000
}

const fn default_light_timeout() -> u64 {
    600
}

const fn default_medium_timeout() -> u64 {
    3600
}

const fn default_heavy_timeout() -> u64 {
    6000
}

fn default_probe_command() -> String {
    "claude -p 'reply with the single word ok' --output-format text".to_string()
}

fn default_sensitive_patterns() -> Vec<String> {
    vec![
        // Emails
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b".to_string(),
        // International phone numbers
        r"\+\d{1,3}[-.\s]?\d{6,14}\b".to_string(),
        // Long-token API keys (sk-..., sk-ant-...)
        r"\bsk-[A-Za-z0-9-]{20,}\b".to_string(),
        // AWS access keys
        r"\bAKIA[0-9A-Z]{16}\b".to_string(),
        // Bearer tokens
        r"\bBearer\s+[A-Za-z0-9+/=_-]{20,}".to_string(),
        // JWTs
        r"\bey[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\b".to_string(),
        // Credit-card-shaped numbers
        r"\b\d{4}[-\s]\d{4}[-\s]\d{4}[-\s]\d{4}\b".to_string(),
        // Base64 credentials
        r"\b[A-Za-z0-9+/]{40,}={0,2}\b".to_string(),
    ]
}

fn default_blocked_patterns() -> BTreeMap<String, String> {
    BTreeMap::from(
        [
            ("destructive_fs", r"rm\s+(-[a-zA-Z]+\s+)*-[a-zA-Z]*[rf][a-zA-Z]*\s+/\S*"),
            ("filesystem_format", r"\bmkfs(\.\w+)?\b"),
            ("raw_disk_write", r"\bdd\s+[^|;]*of=/dev/(sd|nvme|hd)"),
            ("raw_disk_redirect", r">\s*/dev/sd[a-z]"),
            ("fork_bomb", r":\(\)\s*\{[^}]*\};\s*:"),
            ("disk_shred", r"\bshred\b[^|;]*/dev/"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    )
}

fn default_review_patterns() -> BTreeMap<String, String> {
    BTreeMap::from(
        [
            ("privilege_escalation", r"\bsudo\b|\bdoas\b"),
            ("permission_widening", r"chmod\s+(-R\s+)?777"),
            ("remote_exec", r"\b(curl|wget)\b[^|;]*\|\s*(ba|z)?sh\b"),
            ("reverse_shell", r"/dev/tcp/|\b(ba)?sh\s+-i\b"),
            ("raw_network", r"\b(nc|netcat|ncat)\s+(-\w+\s+)*\d{1,3}\.\d{1,3}\."),
            ("scheduler_tamper", r"\bcrontab\b|\bsystemctl\s+(enable|disable|mask)\b"),
            ("account_tamper", r"\buserdel\b|\busermod\b|\bpasswd\b"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    )
}

fn default_rate_limit_patterns() -> Vec<String> {
    vec![
        r"rate limit.{0,40}exceeded".to_string(),
        r"quota.{0,40}exceeded".to_string(),
        r"too many requests".to_string(),
        r"5-hour limit.{0,40}reached".to_string(),
        r"usage limit.{0,40}reached".to_string(),
        r"session.{0,20}limit.{0,40}reached".to_string(),
    ]
}

fn default_tool_allowlist() -> BTreeMap<String, Vec<String>> {
    let light = vec!["Read".to_string(), "Grep".to_string(), "Glob".to_string()];
    let mut medium = light.clone();
    medium.extend(
        ["Write", "Edit", "Bash(git:*)"]
            .into_iter()
            .map(String::from),
    );
    let mut heavy = medium.clone();
    heavy.extend(["Bash", "WebFetch"].into_iter().map(String::from));

    BTreeMap::from([
        ("light".to_string(), light),
        ("medium".to_string(), medium),
        ("heavy".to_string(), heavy),
    ])
}

impl Default for Config {
    fn default() -> Self {
        // An empty TOML document deserializes every field from its default.
        toml::from_str("").expect("default config must deserialize")
    }
}

impl Config {
    /// Load configuration from a TOML file, or defaults if the file does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, fails to parse,
    /// contains unknown keys, or carries an invalid value.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&raw)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool allow-lists are not nested
    /// (`light ⊆ medium ⊆ heavy`) or a numeric option is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit_backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "rate_limit_backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.default_unban_wait_seconds == 0 {
            return Err(ConfigError::Invalid(
                "default_unban_wait_seconds must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be positive".to_string(),
            ));
        }

        let light = self.tools_for(TaskClass::Light);
        let medium = self.tools_for(TaskClass::Medium);
        let heavy = self.tools_for(TaskClass::Heavy);
        if !light.iter().all(|t| medium.contains(t)) {
            return Err(ConfigError::Invalid(
                "class_tool_allowlist: light tools must be a subset of medium".to_string(),
            ));
        }
        if !medium.iter().all(|t| heavy.contains(t)) {
            return Err(ConfigError::Invalid(
                "class_tool_allowlist: medium tools must be a subset of heavy".to_string(),
            ));
        }
        Ok(())
    }

    /// Tool allow-list for a task class.
    #[must_use]
    pub fn tools_for(&self, class: TaskClass) -> Vec<String> {
        self.class_tool_allowlist
            .get(class.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Subprocess timeout for a task class, in seconds.
    #[must_use]
    pub const fn timeout_for(&self, class: TaskClass) -> u64 {
        match class {
            TaskClass::Light => self.agent_timeout_seconds.light,
            TaskClass::Medium => self.agent_timeout_seconds.medium,
            TaskClass::Heavy => self.agent_timeout_seconds.heavy,
        }
    }

    /// Concurrency cap for a task class.
    #[must_use]
    pub fn concurrency_for(&self, class: TaskClass) -> usize {
        self.class_concurrency
            .get(class.as_str())
            .copied()
            .unwrap_or(self.num_workers)
    }

    /// Path to the durable ledger.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.base_dir.join("store").join("ledger.db")
    }

    /// Directory holding per-task working state.
    #[must_use]
    pub fn tasks_dir(&self) -> PathBuf {
        self.base_dir.join("tasks")
    }

    /// Working directory for a specific task.
    #[must_use]
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id)
    }

    /// Directory holding append-only logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Transient queue scratch directory.
    #[must_use]
    pub fn queue_dir(&self) -> PathBuf {
        self.base_dir.join("queue")
    }

    /// Transient snapshot scratch directory.
    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }

    /// Create every directory the system writes into.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            self.base_dir.join("store"),
            self.tasks_dir(),
            self.logs_dir(),
            self.queue_dir(),
            self.snapshots_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session_limit_seconds, 18_000);
        assert_eq!(config.default_unban_wait_seconds, 3600);
        assert!((config.rate_limit_backoff_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.heartbeat_interval_seconds, 30);
        assert_eq!(config.health_check_interval_seconds, 60);
        assert_eq!(config.max_output_size_bytes, 50 * 1024 * 1024);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.min_disk_space_gb, 5);
        assert_eq!(config.metrics_port, 8000);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<Config, _> = toml::from_str("no_such_option = 1");
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_file_overrides() {
        let config: Config = toml::from_str("num_workers = 4\nmax_attempts = 2").unwrap();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.max_attempts, 2);
        // Everything else stays at its default.
        assert_eq!(config.heartbeat_interval_seconds, 30);
    }

    #[test]
    fn test_tool_allowlist_nesting() {
        let config = Config::default();
        let light = config.tools_for(TaskClass::Light);
        let medium = config.tools_for(TaskClass::Medium);
        let heavy = config.tools_for(TaskClass::Heavy);

        assert!(light.iter().all(|t| medium.contains(t)));
        assert!(medium.iter().all(|t| heavy.contains(t)));
    }

    #[test]
    fn test_invalid_allowlist_rejected() {
        let mut config = Config::default();
        config
            .class_tool_allowlist
            .insert("heavy".to_string(), vec!["Read".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        let mut config = Config::default();
        config.rate_limit_backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_class_concurrency_defaults_to_num_workers() {
        let config = Config::default();
        assert_eq!(config.concurrency_for(TaskClass::Heavy), config.num_workers);

        let config: Config = toml::from_str("[class_concurrency]\nheavy = 1").unwrap();
        assert_eq!(config.concurrency_for(TaskClass::Heavy), 1);
        assert_eq!(config.concurrency_for(TaskClass::Light), config.num_workers);
    }

    #[test]
    fn test_derived_paths() {
        let config: Config = toml::from_str("base_dir = \"/srv/autoclaude\"").unwrap();
        assert_eq!(
            config.ledger_path(),
            PathBuf::from("/srv/autoclaude/store/ledger.db")
        );
        assert_eq!(
            config.task_dir("task_abc"),
            PathBuf::from("/srv/autoclaude/tasks/task_abc")
        );
    }
}
