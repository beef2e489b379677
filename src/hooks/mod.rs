//! Tool-call interception
//!
//! Every tool call the agent asks permission for is sorted into a closed set of
//! [`ToolCall`] variants. The turn engine dispatches on the variant; this
//! module only classifies and renders verdicts into hook replies.
//!
//! The long-running heuristic is a routing hint. It matches common
//! install, build and test invocations and is not a security boundary.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::agent::ToolVerdict;
use crate::types::hooks::HookOutput;

/// Name of the shell tool
pub const SHELL_TOOL: &str = "Bash";

/// Substituted output is clipped to this many trailing characters
pub const MAX_SUBSTITUTED_CHARS: usize = 30_000;

static LONG_RUNNING_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(concat!(
        // start of a command segment, after any env assignments or wrappers
        r"(?:^|[;&|(]\s*)",
        r"(?:[A-Za-z_][A-Za-z0-9_]*=\S*\s+|(?:sudo|time|nice|env)\s+)*",
        r"(?:",
        r"(?:npm|pnpm|yarn|bun)\s+(?:install|i|ci|add|build|test|run\s+(?:build|test))\b",
        r"|cargo\s+(?:build|test|install|check|clippy)\b",
        r"|(?:pip3?|poetry|uv(?:\s+pip)?)\s+(?:install|sync)\b",
        r"|go\s+(?:build|test|mod\s+download)\b",
        r"|docker\s+(?:build|pull|compose\s+build)\b",
        r"|(?:make|mvn|gradle|\./gradlew|pytest)(?:$|[\s;&|)])",
        r")",
    ))
    .map_err(|e| log::error!("invalid long-running pattern: {e}"))
    .ok()
});

/// Whether `command` looks like an install, build or test invocation
#[must_use]
pub fn is_long_running_command(command: &str) -> bool {
    LONG_RUNNING_RE
        .as_ref()
        .is_some_and(|re| re.is_match(command.trim()))
}

/// Classified tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    /// Shell command explicitly marked to run in the background
    ShellBackground {
        /// Command text
        command: String,
        /// Short description supplied by the agent
        description: Option<String>,
    },
    /// Shell command expected to run long; executed out of band while the call blocks
    ShellLongRunning {
        /// Command text
        command: String,
    },
    /// Any other shell command
    ShellOrdinary,
    /// Not a shell tool
    Other,
}

impl ToolCall {
    /// Sort a tool call by name and input
    #[must_use]
    pub fn classify(tool_name: &str, input: &Value) -> Self {
        if tool_name != SHELL_TOOL {
            return Self::Other;
        }
        let Some(command) = input
            .get("command")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
        else {
            return Self::ShellOrdinary;
        };

        let background = input
            .get("run_in_background")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if background {
            return Self::ShellBackground {
                command: command.to_string(),
                description: input
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
        }

        if is_long_running_command(command) {
            return Self::ShellLongRunning {
                command: command.to_string(),
            };
        }
        Self::ShellOrdinary
    }
}

/// Keep the last [`MAX_SUBSTITUTED_CHARS`] characters of `output`
#[must_use]
pub fn clip_output(output: &str) -> String {
    let count = output.chars().count();
    if count <= MAX_SUBSTITUTED_CHARS {
        return output.to_string();
    }
    let skipped = count - MAX_SUBSTITUTED_CHARS;
    let tail: String = output.chars().skip(skipped).collect();
    format!("[... {skipped} characters truncated ...]\n{tail}")
}

/// Shell command that prints `output` verbatim and exits with `exit_code`
#[must_use]
pub fn substitution_command(output: &str, exit_code: i32) -> String {
    let clipped = clip_output(&output.replace('\0', ""));
    let quoted = shlex::try_quote(&clipped)
        .map(|q| q.into_owned())
        .unwrap_or_else(|_| "''".to_string());
    format!("printf '%s' {quoted}; exit {exit_code}")
}

/// Render a verdict as a `PreToolUse` hook reply for a shell call with `input`
///
/// `Substitute` keeps the call allowed but swaps the command for one that
/// replays the captured output, so the agent sees an ordinary tool result.
#[must_use]
pub fn hook_output_for(verdict: &ToolVerdict, input: &Value) -> HookOutput {
    match verdict {
        ToolVerdict::Allow => HookOutput::allow(),
        ToolVerdict::Deny { reason } => HookOutput::deny(reason.clone()),
        ToolVerdict::Substitute { output, exit_code } => {
            let mut updated = match input {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            updated.insert(
                "command".to_string(),
                Value::String(substitution_command(output, *exit_code)),
            );
            updated.insert("run_in_background".to_string(), Value::Bool(false));
            HookOutput::allow_with_input(Value::Object(updated))
        }
    }
}
