//! Schedule subcommands: crontab-backed periodic submissions.

use std::path::Path;

use anyhow::Result;
use autoclaude_core::schedule::{ScheduleManager, SystemCrontab};
use autoclaude_core::task::TaskClass;
use clap::Subcommand;

/// Schedule management commands.
#[derive(Subcommand, Debug)]
pub enum ScheduleCommands {
    /// Add a periodic submission
    Add {
        /// Task name the schedule will submit
        name: String,

        /// Five-field cron expression, e.g. "0 3 * * *"
        #[arg(long)]
        cron: String,

        /// Task description
        #[arg(short, long)]
        description: Option<String>,

        /// Task class
        #[arg(long, default_value = "heavy_context")]
        class: String,

        /// Working directory for the submitted tasks
        #[arg(long)]
        working_dir: Option<String>,
    },

    /// Remove a schedule
    Remove {
        /// Schedule ID
        id: String,
    },

    /// List schedules
    List,

    /// Enable a disabled schedule
    Enable {
        /// Schedule ID
        id: String,
    },

    /// Disable a schedule without removing it
    Disable {
        /// Schedule ID
        id: String,
    },
}

/// Dispatch a schedule subcommand.
pub fn run(config_path: &Path, cmd: &ScheduleCommands) -> Result<()> {
    let manager = ScheduleManager::new(SystemCrontab);
    match cmd {
        ScheduleCommands::Add {
            name,
            cron,
            description,
            class,
            working_dir,
        } => {
            let class = TaskClass::parse(class)?;
            let command = submission_command(
                config_path,
                name,
                description.as_deref(),
                class,
                working_dir.as_deref(),
            );
            let id = manager.add(name, cron, &command)?;
            println!("schedule created: {id}");
            println!("  {cron} -> {command}");
            Ok(())
        }
        ScheduleCommands::Remove { id } => {
            manager.remove(id)?;
            println!("schedule {id} removed");
            Ok(())
        }
        ScheduleCommands::List => {
            let entries = manager.list()?;
            if entries.is_empty() {
                println!("no schedules");
                return Ok(());
            }
            println!("{:<16} {:<24} {:<16} {:<8}", "ID", "NAME", "CRON", "STATE");
            for entry in entries {
                println!(
                    "{:<16} {:<24} {:<16} {:<8}",
                    entry.id,
                    entry.name,
                    entry.cron_expr,
                    if entry.enabled { "enabled" } else { "disabled" },
                );
            }
            Ok(())
        }
        ScheduleCommands::Enable { id } => {
            manager.enable(id)?;
            println!("schedule {id} enabled");
            Ok(())
        }
        ScheduleCommands::Disable { id } => {
            manager.disable(id)?;
            println!("schedule {id} disabled");
            Ok(())
        }
    }
}

/// Build the `taskctl task create` invocation a cron entry runs.
fn submission_command(
    config_path: &Path,
    name: &str,
    description: Option<&str>,
    class: TaskClass,
    working_dir: Option<&str>,
) -> String {
    let exe = std::env::current_exe()
        .map_or_else(|_| "taskctl".to_string(), |p| p.display().to_string());

    let mut parts = vec![
        quote(&exe),
        "--config".to_string(),
        quote(&config_path.display().to_string()),
        "task".to_string(),
        "create".to_string(),
        quote(name),
        "--class".to_string(),
        class.as_str().to_string(),
    ];
    if let Some(description) = description {
        parts.push("--description".to_string());
        parts.push(quote(description));
    }
    if let Some(dir) = working_dir {
        parts.push("--working-dir".to_string());
        parts.push(quote(dir));
    }
    parts.join(" ")
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
