//! taskctl - command-line interface for managing auto-claude tasks.
//!
//! A thin client over the store: submits, lists, and operates on tasks,
//! and manages the crontab-based periodic submitter.
//!
//! Exit codes: 0 on success, 2 on validation error, 3 when the store is
//! unavailable.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use autoclaude_core::config::ConfigError;
use autoclaude_core::schedule::ScheduleError;
use autoclaude_core::store::StoreError;
use autoclaude_core::task::TaskError;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// taskctl - auto-claude task management
#[derive(Parser, Debug)]
#[command(name = "taskctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "autoclaude.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Task management
    #[command(subcommand)]
    Task(commands::task::TaskCommands),

    /// Periodic submission schedules (crontab-backed)
    #[command(subcommand)]
    Schedule(commands::schedule::ScheduleCommands),

    /// Security report: blocked tasks and recent findings
    Security,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let result = run(&cli);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Task(cmd) => commands::task::run(&cli.config, cmd),
        Commands::Schedule(cmd) => commands::schedule::run(&cli.config, cmd),
        Commands::Security => commands::task::security_report(&cli.config),
    }
}

/// Map error classes to the documented exit codes, walking the cause
/// chain so wrapped errors classify the same as bare ones.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    use autoclaude_core::orchestrator::OrchestratorError;

    for cause in err.chain() {
        if cause.downcast_ref::<TaskError>().is_some()
            || cause.downcast_ref::<ConfigError>().is_some()
            || matches!(
                cause.downcast_ref::<ScheduleError>(),
                Some(ScheduleError::InvalidCron(_) | ScheduleError::NotFound(_))
            )
            || matches!(
                cause.downcast_ref::<OrchestratorError>(),
                Some(OrchestratorError::NotFound(_) | OrchestratorError::WrongState { .. })
            )
        {
            return 2;
        }
        if let Some(store_err) = cause.downcast_ref::<StoreError>() {
            return match store_err {
                StoreError::NotFound { .. } => 2,
                _ => 3,
            };
        }
    }
    1
}
