//! Task subcommands.

use std::path::Path;

use anyhow::Result;
use autoclaude_core::gate::Verdict;
use autoclaude_core::task::{Task, TaskClass, TaskPriority, TaskSpec, TaskState};
use clap::Subcommand;

/// Task management commands.
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Create a new task
    Create {
        /// Task name
        name: String,

        /// What the agent should do; the command is generated from this
        #[arg(short, long)]
        description: Option<String>,

        /// Task class
        #[arg(long, default_value = "lightweight")]
        class: String,

        /// Dispatch priority
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Working directory for the agent subprocess
        #[arg(long)]
        working_dir: Option<String>,

        /// Environment variables (KEY=VALUE, repeatable)
        #[arg(long = "env")]
        env: Vec<String>,

        /// Tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Idempotency key: re-submitting the same key is a no-op
        #[arg(long)]
        dedup_key: Option<String>,
    },

    /// List tasks
    List {
        /// Filter by state (repeatable)
        #[arg(long = "state")]
        states: Vec<String>,

        /// Maximum number of tasks to show
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Output format
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Show one task in detail
    Show {
        /// Task ID
        id: String,
    },

    /// Cancel a non-terminal task
    Cancel {
        /// Task ID
        id: String,
    },

    /// Pause a processing task
    Pause {
        /// Task ID
        id: String,
    },

    /// Resume a paused task
    Resume {
        /// Task ID
        id: String,
    },

    /// Return a blocked task to the queue after review
    Unblock {
        /// Task ID
        id: String,
    },
}

/// Dispatch a task subcommand.
pub fn run(config_path: &Path, cmd: &TaskCommands) -> Result<()> {
    let app = super::open(config_path)?;
    match cmd {
        TaskCommands::Create {
            name,
            description,
            class,
            priority,
            working_dir,
            env,
            tags,
            dedup_key,
        } => {
            let class = TaskClass::parse(class)?;
            let priority = TaskPriority::parse(priority)?;

            let mut builder = TaskSpec::builder()
                .name(name.as_str())
                .description(description.clone().unwrap_or_else(|| name.clone()))
                .class(class)
                .priority(priority);
            if let Some(dir) = working_dir {
                builder = builder.working_dir(dir.as_str());
            }
            for pair in env {
                match pair.split_once('=') {
                    Some((key, value)) => builder = builder.env(key, value),
                    None => eprintln!("warning: ignoring malformed env var: {pair}"),
                }
            }
            for tag in tags {
                builder = builder.tag(tag.as_str());
            }
            if let Some(key) = dedup_key {
                builder = builder.dedup_key(key.as_str());
            }

            let (task_id, verdict) = app.orchestrator.submit(&builder.build())?;
            match verdict {
                Verdict::Allowed => println!("task created: {task_id}"),
                Verdict::NeedsReview | Verdict::Blocked => {
                    println!("task created: {task_id}");
                    println!(
                        "security scan verdict: {verdict}; parked for review \
                         (taskctl task unblock {task_id} to release)"
                    );
                }
            }
            Ok(())
        }
        TaskCommands::List {
            states,
            limit,
            format,
        } => list(&app, states, *limit, format),
        TaskCommands::Show { id } => show(&app, id),
        TaskCommands::Cancel { id } => {
            let task = app.orchestrator.cancel(id)?;
            println!("task {id} cancelled (was holding {} attempt(s))", task.attempt_count);
            Ok(())
        }
        TaskCommands::Pause { id } => {
            app.orchestrator.pause(id)?;
            println!("task {id} paused");
            Ok(())
        }
        TaskCommands::Resume { id } => {
            app.orchestrator.resume(id)?;
            println!("task {id} resumed");
            Ok(())
        }
        TaskCommands::Unblock { id } => {
            app.orchestrator.unblock(id)?;
            println!("task {id} unblocked and re-queued");
            Ok(())
        }
    }
}

fn list(app: &super::App, states: &[String], limit: usize, format: &str) -> Result<()> {
    let filter: Option<Vec<TaskState>> = if states.is_empty() {
        None
    } else {
        Some(
            states
                .iter()
                .map(|s| TaskState::parse(s))
                .collect::<Result<_, _>>()?,
        )
    };
    let tasks = app.store.list(filter.as_deref(), limit)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("no tasks found");
        return Ok(());
    }
    println!(
        "{:<18} {:<24} {:<18} {:<8} {:<8} {:<12}",
        "ID", "NAME", "STATE", "CLASS", "PRIO", "CREATED"
    );
    for task in tasks {
        println!(
            "{:<18} {:<24} {:<18} {:<8} {:<8} {:<12}",
            clip(&task.id, 18),
            clip(&task.name, 24),
            task.state,
            task.class,
            task.priority,
            task.created_at.format("%Y-%m-%d"),
        );
    }
    Ok(())
}

fn show(app: &super::App, id: &str) -> Result<()> {
    let task = app
        .store
        .get(id)?
        .ok_or_else(|| anyhow::anyhow!("task not found: {id}"))?;

    print_task(&task);

    let findings = app.store.findings_for(id)?;
    if !findings.is_empty() {
        println!("\nsecurity findings:");
        for finding in findings {
            println!("  - {} ({:?})", finding.kind, finding.severity);
        }
    }

    if !task.last_output_tail.is_empty() {
        println!("\nlast output:");
        let recent: Vec<&str> = task.last_output_tail.lines().rev().take(10).collect();
        for line in recent.iter().rev() {
            println!("  {line}");
        }
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("id:          {}", task.id);
    println!("name:        {}", task.name);
    println!("state:       {}", task.state);
    println!("class:       {}", task.class);
    println!("priority:    {}", task.priority);
    println!("attempts:    {}/{}", task.attempt_count, task.max_attempts);
    println!("created:     {}", task.created_at);
    if let Some(worker) = &task.worker_id {
        println!("worker:      {worker}");
    }
    if let Some(kind) = task.failure_kind {
        println!("failure:     {kind}");
    }
    if let Some(error) = &task.last_error {
        println!("last error:  {error}");
    }
    if let Some(at) = task.next_attempt_at {
        println!("next try:    {at}");
    }
    println!("verdict:     {}", task.security_verdict.as_str());
}

/// Security report: blocked tasks awaiting review plus their findings.
pub fn security_report(config_path: &Path) -> Result<()> {
    let app = super::open(config_path)?;
    let blocked = app.store.sweep(&[TaskState::NeedsHumanReview])?;

    if blocked.is_empty() {
        println!("security status: healthy (no tasks awaiting review)");
        return Ok(());
    }
    println!(
        "security status: needs attention ({} task(s) awaiting review)",
        blocked.len()
    );
    for task in blocked {
        let findings = app.store.findings_for(&task.id)?;
        let kinds: Vec<&str> = findings.iter().map(|f| f.kind.as_str()).collect();
        println!(
            "  {} {:<24} [{}]",
            task.id,
            clip(&task.name, 24),
            kinds.join(", ")
        );
    }
    Ok(())
}

fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let end = (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0);
        &s[..end]
    }
}
