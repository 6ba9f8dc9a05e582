//! autoclaude-daemon - unattended agent CLI task supervisor.
//!
//! The daemon wires the core components together and keeps them running
//! 24x7: the durable store, the security gate, the rate-limit arbiter,
//! a pool of workers, the recovery loop, the orchestrator, and the
//! read-only Prometheus metrics surface.
//!
//! The daemon runs in the foreground; process supervision (restart on
//! crash, log shepherding) is the host's job.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use autoclaude_core::alerts::AlertSink;
use autoclaude_core::arbiter::RateLimitArbiter;
use autoclaude_core::clock::{SharedClock, SystemClock};
use autoclaude_core::config::Config;
use autoclaude_core::gate::SecurityGate;
use autoclaude_core::metrics::{new_shared_registry, SharedMetrics};
use autoclaude_core::orchestrator::Orchestrator;
use autoclaude_core::recovery::{CommandProber, RecoveryLoop};
use autoclaude_core::store::Store;
use autoclaude_core::worker::{ControlRegistry, WorkerContext, WorkerPool};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// auto-claude daemon - unattended agent CLI task supervisor
#[derive(Parser, Debug)]
#[command(name = "autoclaude-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "autoclaude.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Override the metrics port from the config file
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Disable the Prometheus metrics HTTP endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Path to PID file
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

fn write_pid_file(pid_path: &PathBuf) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_path, std::process::id().to_string())?;
    info!("PID file written to {:?}", pid_path);
    Ok(())
}

fn remove_pid_file(pid_path: &PathBuf) {
    if pid_path.exists() {
        if let Err(e) = std::fs::remove_file(pid_path) {
            warn!("failed to remove PID file: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging.
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Load configuration.
    let mut config = Config::load(&args.config).context("failed to load configuration")?;
    if !args.config.exists() {
        info!("no config file at {:?}, using defaults", args.config);
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }
    config
        .ensure_directories()
        .context("failed to create data directories")?;
    let config = Arc::new(config);

    info!("auto-claude daemon starting (pid: {})", std::process::id());
    info!(base_dir = %config.base_dir.display(), workers = config.num_workers,
          "configuration loaded");

    // Construct the collaborators once and hand them down.
    let clock: SharedClock = Arc::new(SystemClock);
    let store = Arc::new(
        Store::open_with_clock(config.ledger_path(), clock.clone())
            .context("failed to open task store")?,
    );
    let gate = Arc::new(SecurityGate::from_config(&config).context("invalid security patterns")?);
    let arbiter = Arc::new(RateLimitArbiter::new(&config, clock.clone()));
    let metrics = new_shared_registry().context("failed to initialize metrics")?;
    let alerts = Arc::new(AlertSink::new(config.logs_dir().join("alerts.jsonl")));
    let controls = Arc::new(ControlRegistry::new());
    let resource_ok = Arc::new(AtomicBool::new(true));

    let pid_path = args
        .pid_file
        .clone()
        .unwrap_or_else(|| config.base_dir.join("autoclaude.pid"));
    write_pid_file(&pid_path)?;

    let (orchestrator, outcome_tx) = Orchestrator::new(
        store.clone(),
        gate.clone(),
        arbiter.clone(),
        config.clone(),
        clock.clone(),
        controls.clone(),
        metrics.clone(),
        alerts.clone(),
    );

    let worker_ctx = WorkerContext {
        store: store.clone(),
        gate,
        arbiter: arbiter.clone(),
        config: config.clone(),
        clock: clock.clone(),
        controls,
        outcomes: outcome_tx,
        resource_ok: resource_ok.clone(),
    };
    let pool = WorkerPool::spawn(&worker_ctx);
    info!("spawned {} worker(s)", pool.len());

    let recovery = RecoveryLoop::new(
        store,
        arbiter,
        config.clone(),
        clock,
        metrics.clone(),
        alerts,
        Arc::new(CommandProber::new(&config)),
        resource_ok,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Arc::new(orchestrator);
    let orchestrator_task = {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };
    let recovery_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { recovery.run(shutdown).await })
    };

    // Read-only metrics surface.
    let metrics_task = if args.no_metrics {
        info!("metrics HTTP server disabled");
        None
    } else {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
        let registry = metrics.clone();
        info!(%addr, "starting metrics HTTP server");
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(registry, addr).await {
                error!("metrics server error: {e}");
            }
        }))
    };

    // Wait for a termination signal.
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    // Graceful shutdown: workers first, then the loops.
    info!("shutting down...");
    let _ = shutdown_tx.send(true);
    pool.shutdown().await;
    let _ = orchestrator_task.await;
    let _ = recovery_task.await;
    if let Some(task) = metrics_task {
        task.abort();
    }
    remove_pid_file(&pid_path);
    info!("daemon shutdown complete");
    Ok(())
}

/// Serve `/metrics` in Prometheus text format.
async fn run_metrics_server(metrics: SharedMetrics, addr: SocketAddr) -> Result<()> {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let handler = move || {
        let metrics = metrics.clone();
        async move {
            match metrics.encode_text() {
                Ok(body) => (
                    StatusCode::OK,
                    [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                    body,
                )
                    .into_response(),
                Err(e) => {
                    error!("failed to encode metrics: {e}");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("failed to encode metrics: {e}"),
                    )
                        .into_response()
                }
            }
        }
    };

    let app = Router::new().route("/metrics", get(handler)).route(
        "/",
        get(|| async { "auto-claude daemon\n\nGET /metrics - Prometheus metrics endpoint\n" }),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;
    info!(%addr, "metrics HTTP server listening");
    axum::serve(listener, app)
        .await
        .context("metrics server error")?;
    Ok(())
}
