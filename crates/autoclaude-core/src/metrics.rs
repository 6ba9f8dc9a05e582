//! Prometheus metrics.
//!
//! Counters and gauges the core maintains, exported in Prometheus text
//! format for the read-only HTTP surface.

use std::sync::Arc;

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// The core's metric families.
///
/// All metrics use interior mutability and are safe to share across
/// tasks. The struct is `Clone`, `Send`, and `Sync`.
#[derive(Clone)]
pub struct CoreMetrics {
    /// Terminal task outcomes, labeled by status.
    task_runs_total: CounterVec,

    /// Age of each worker's last heartbeat, in seconds.
    worker_heartbeat_age: GaugeVec,

    /// Tasks currently in each state.
    queue_tasks_total: GaugeVec,

    /// Free disk space on the base directory's filesystem.
    system_disk_free_bytes: Gauge,

    /// Memory in use, as a percentage.
    system_memory_used_percent: Gauge,

    /// Whether the agent service is available (0/1).
    rate_limit_available: Gauge,
}

impl CoreMetrics {
    /// Creates the metric families and registers them.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let task_runs_total = CounterVec::new(
            Opts::new("task_runs_total", "Terminal task outcomes by status"),
            &["status"],
        )?;
        registry.register(Box::new(task_runs_total.clone()))?;

        let worker_heartbeat_age = GaugeVec::new(
            Opts::new(
                "worker_heartbeat_age_seconds",
                "Seconds since each worker's last heartbeat",
            ),
            &["worker_id"],
        )?;
        registry.register(Box::new(worker_heartbeat_age.clone()))?;

        let queue_tasks_total = GaugeVec::new(
            Opts::new("queue_tasks_total", "Tasks currently in each state"),
            &["state"],
        )?;
        registry.register(Box::new(queue_tasks_total.clone()))?;

        let system_disk_free_bytes = Gauge::new(
            "system_disk_free_bytes",
            "Free disk space on the data filesystem",
        )?;
        registry.register(Box::new(system_disk_free_bytes.clone()))?;

        let system_memory_used_percent = Gauge::new(
            "system_memory_used_percent",
            "System memory in use, percent",
        )?;
        registry.register(Box::new(system_memory_used_percent.clone()))?;

        let rate_limit_available = Gauge::new(
            "rate_limit_available",
            "Whether the agent service is available (0/1)",
        )?;
        rate_limit_available.set(1.0);
        registry.register(Box::new(rate_limit_available.clone()))?;

        Ok(Self {
            task_runs_total,
            worker_heartbeat_age,
            queue_tasks_total,
            system_disk_free_bytes,
            system_memory_used_percent,
            rate_limit_available,
        })
    }

    /// Count a terminal task outcome.
    pub fn task_run(&self, status: &str) {
        self.task_runs_total
            .with_label_values(&[truncate_label(status)])
            .inc();
    }

    /// Returns the outcome count for a status, for tests.
    #[must_use]
    pub fn task_run_count(&self, status: &str) -> f64 {
        self.task_runs_total
            .with_label_values(&[truncate_label(status)])
            .get()
    }

    /// Record a worker's heartbeat age.
    pub fn worker_heartbeat_age(&self, worker_id: &str, age_secs: f64) {
        self.worker_heartbeat_age
            .with_label_values(&[truncate_label(worker_id)])
            .set(age_secs);
    }

    /// Record the number of tasks in a state.
    #[allow(clippy::cast_precision_loss)] // queue depths are small
    pub fn queue_depth(&self, state: &str, count: u64) {
        self.queue_tasks_total
            .with_label_values(&[truncate_label(state)])
            .set(count as f64);
    }

    /// Record free disk space.
    #[allow(clippy::cast_precision_loss)]
    pub fn disk_free_bytes(&self, bytes: u64) {
        self.system_disk_free_bytes.set(bytes as f64);
    }

    /// Record memory usage.
    pub fn memory_used_percent(&self, percent: f64) {
        self.system_memory_used_percent.set(percent);
    }

    /// Record agent availability.
    pub fn rate_limit_available(&self, available: bool) {
        self.rate_limit_available
            .set(if available { 1.0 } else { 0.0 });
    }
}

/// Registry wrapper: holds the Prometheus registry and the core metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    core: CoreMetrics,
}

impl MetricsRegistry {
    /// Creates a new registry with the core metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let core = CoreMetrics::new(&registry)?;
        Ok(Self { registry, core })
    }

    /// Returns the core metrics.
    #[must_use]
    pub const fn core(&self) -> &CoreMetrics {
        &self.core
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry.
pub type SharedMetrics = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> Result<SharedMetrics, MetricsError> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

/// Truncate a label value at a character boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}
