//! Agent command generation.
//!
//! Converts a task's name, description, and class into the command string
//! passed to the agent CLI: a categorized prompt, the unattended-execution
//! suffix, and the per-class tool allow-list flags.

use crate::config::Config;
use crate::task::TaskClass;

/// Marker the agent must emit when a task finished without manual steps.
pub const COMPLETION_MARKER: &str = "TASK_COMPLETED";

/// Instruction block appended to every generated prompt. The supervisor
/// runs unattended, so the agent must never wait for confirmation.
const UNATTENDED_SUFFIX: &str = "\n\nIMPORTANT: This is an automated task execution. \
Do not ask for confirmation or user input. If you have the necessary tools and \
permissions, execute the requested actions directly. If you cannot complete the \
action due to missing tools or authentication, provide specific instructions for \
manual completion instead of asking for confirmation.\n\
COMPLETION RULE: when ALL requested actions are successfully completed, end your \
response with: TASK_COMPLETED. Only use this marker if the task is fully complete \
without requiring any manual steps.";

/// Extra instruction for heavy tasks: the chunk protocol the resume
/// machinery depends on.
const CHUNK_PROTOCOL_SUFFIX: &str = "\nCHUNKING RULE: split the work into ordered \
chunks. Announce each chunk as [[chunk:<id>:start]] before working on it and \
[[chunk:<id>:done]] once it is complete. Use short stable identifiers.";

/// Broad category of a task, inferred from its wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    /// Fix a defect.
    Debug,
    /// Restructure existing code.
    Refactor,
    /// Review code or artifacts.
    Review,
    /// Explain or analyze code.
    Analyze,
    /// Improve performance.
    Optimize,
    /// Build something new.
    Implement,
    /// Write or extend tests.
    Test,
    /// Write documentation.
    Documentation,
    /// Anything else.
    General,
}

impl TaskCategory {
    /// Keyword table, most specific first. The first category with any
    /// keyword hit wins ties by hit count.
    const KEYWORDS: [(Self, &'static [&'static str]); 8] = [
        (Self::Debug, &["debug", "fix", "bug", "broken", "crash", "regression"]),
        (Self::Refactor, &["refactor", "restructure", "clean up", "cleanup", "rework"]),
        (Self::Test, &["unit test", "integration test", "test case", "e2e", "coverage"]),
        (Self::Review, &["review", "audit", "validate", "inspect"]),
        (Self::Analyze, &["analyze", "analyse", "understand", "explain", "investigate"]),
        (Self::Optimize, &["optimize", "optimise", "performance", "speed up", "memory"]),
        (Self::Implement, &["implement", "build", "develop", "add", "create", "support"]),
        (Self::Documentation, &["document", "documentation", "docstring", "readme"]),
    ];

    /// Categorize a task from its name and description.
    #[must_use]
    pub fn infer(name: &str, description: &str) -> Self {
        let text = format!("{name} {description}").to_lowercase();
        let mut best = (Self::General, 0usize);
        for (category, keywords) in Self::KEYWORDS {
            let score = keywords.iter().filter(|k| text.contains(*k)).count();
            if score > best.1 {
                best = (category, score);
            }
        }
        best.0
    }
}

/// Render the prompt for a task.
fn render_prompt(name: &str, description: &str, category: TaskCategory) -> String {
    let subject = if description.is_empty() { name } else { description };
    match category {
        TaskCategory::Debug => format!("Fix the following problem: {subject}"),
        TaskCategory::Refactor => {
            format!("Refactor as described, preserving behavior: {subject}")
        }
        TaskCategory::Review => format!(
            "Review the following, focusing on correctness, security, and performance: {subject}"
        ),
        TaskCategory::Analyze => format!("Analyze and explain: {subject}"),
        TaskCategory::Optimize => format!("Optimize for performance: {subject}"),
        TaskCategory::Implement => format!("Implement the following: {subject}"),
        TaskCategory::Test => format!("Write tests for: {subject}"),
        TaskCategory::Documentation => format!("Write documentation for: {subject}"),
        TaskCategory::General => subject.to_string(),
    }
}

/// Generate the full agent CLI command for a task.
///
/// The prompt is single-quoted for the shell; embedded single quotes are
/// escaped. Tool allow-lists come from the configured per-class mapping.
#[must_use]
pub fn generate_command(
    config: &Config,
    name: &str,
    description: &str,
    class: TaskClass,
) -> String {
    let category = TaskCategory::infer(name, description);
    let mut prompt = render_prompt(name, description, category);
    prompt.push_str(UNATTENDED_SUFFIX);
    if class == TaskClass::Heavy {
        prompt.push_str(CHUNK_PROTOCOL_SUFFIX);
    }

    let mut parts = vec![
        "claude".to_string(),
        "-p".to_string(),
        shell_quote(&prompt),
        "--verbose".to_string(),
        "--output-format".to_string(),
        "text".to_string(),
        "--permission-mode".to_string(),
        "acceptEdits".to_string(),
    ];

    let tools = config.tools_for(class);
    if !tools.is_empty() {
        parts.push("--allowedTools".to_string());
        for tool in tools {
            parts.push(shell_quote(&tool));
        }
    }

    parts.join(" ")
}

/// Single-quote a string for `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_by_keywords() {
        assert_eq!(
            TaskCategory::infer("fix login bug", "the session cookie is broken"),
            TaskCategory::Debug
        );
        assert_eq!(
            TaskCategory::infer("refactor parser", "clean up the tokenizer"),
            TaskCategory::Refactor
        );
        assert_eq!(
            TaskCategory::infer("weekly chores", "rotate the meeting notes"),
            TaskCategory::General
        );
    }

    #[test]
    fn test_generated_command_shape() {
        let config = Config::default();
        let cmd = generate_command(&config, "fix login bug", "cookie broken", TaskClass::Light);

        assert!(cmd.starts_with("claude -p "));
        assert!(cmd.contains("--permission-mode acceptEdits"));
        assert!(cmd.contains("--allowedTools"));
        assert!(cmd.contains("'Read'"));
        assert!(cmd.contains(COMPLETION_MARKER));
        // Light tasks never get shell access.
        assert!(!cmd.contains("'Bash'"));
    }

    #[test]
    fn test_heavy_commands_request_chunk_markers() {
        let config = Config::default();
        let cmd = generate_command(&config, "migrate schema", "migrate all tables", TaskClass::Heavy);
        assert!(cmd.contains("[[chunk:"));
        assert!(cmd.contains("'Bash'"));
    }

    #[test]
    fn test_shell_quoting() {
        assert_eq!(shell_quote("plain"), "'plain'");
        let quoted = shell_quote("it's");
        assert!(quoted.starts_with('\''));
        assert!(quoted.contains(r"'\''"));
    }
}
