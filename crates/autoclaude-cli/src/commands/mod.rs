//! CLI command implementations.

pub mod schedule;
pub mod task;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use autoclaude_core::alerts::AlertSink;
use autoclaude_core::arbiter::RateLimitArbiter;
use autoclaude_core::clock::{SharedClock, SystemClock};
use autoclaude_core::config::Config;
use autoclaude_core::gate::SecurityGate;
use autoclaude_core::metrics::MetricsRegistry;
use autoclaude_core::orchestrator::Orchestrator;
use autoclaude_core::store::Store;
use autoclaude_core::worker::ControlRegistry;

/// The CLI's view of the system: the shared store plus an orchestrator
/// for submissions and operator operations. State transitions land in
/// the shared ledger; the daemon's workers observe them through claim
/// fencing.
pub struct App {
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// The shared store.
    pub store: Arc<Store>,
    /// Orchestrator operations (submit, cancel, pause, resume, unblock).
    pub orchestrator: Orchestrator,
}

/// Open the store and assemble the collaborators.
pub fn open(config_path: &Path) -> Result<App> {
    let config = Arc::new(Config::load(config_path)?);
    config
        .ensure_directories()
        .context("failed to create data directories")?;

    let clock: SharedClock = Arc::new(SystemClock);
    let store = Arc::new(Store::open_with_clock(config.ledger_path(), clock.clone())?);
    let gate = Arc::new(SecurityGate::from_config(&config)?);
    let arbiter = Arc::new(RateLimitArbiter::new(&config, clock.clone()));
    let metrics = Arc::new(MetricsRegistry::new()?);
    let alerts = Arc::new(AlertSink::new(config.logs_dir().join("alerts.jsonl")));

    // The outcome channel goes unused here: the CLI never runs workers.
    let (orchestrator, _outcomes) = Orchestrator::new(
        store.clone(),
        gate,
        arbiter,
        config.clone(),
        clock,
        Arc::new(ControlRegistry::new()),
        metrics,
        alerts,
    );
    Ok(App {
        config,
        store,
        orchestrator,
    })
}
