//! CLI command building logic for subprocess transport

use std::path::Path;

use tokio::process::Command;

use super::config::SubprocessOptions;

/// Command builder for Claude CLI
pub struct CommandBuilder<'a> {
    cli_path: &'a Path,
    options: &'a SubprocessOptions,
}

impl<'a> CommandBuilder<'a> {
    /// Create a new command builder
    pub fn new(cli_path: &'a Path, options: &'a SubprocessOptions) -> Self {
        Self { cli_path, options }
    }

    /// Build the complete CLI command with all arguments
    pub fn build(&self) -> Command {
        let mut cmd = Command::new(self.cli_path);

        // Bidirectional stream-json with partial messages
        cmd.arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages");

        cmd.arg("--permission-mode")
            .arg(self.options.permission_mode.as_str());

        self.add_session_args(&mut cmd);
        cmd
    }

    /// Add model, prompt and resume arguments
    fn add_session_args(&self, cmd: &mut Command) {
        if let Some(ref model) = self.options.model {
            cmd.arg("--model").arg(model);
        }

        if let Some(ref system_prompt) = self.options.system_prompt {
            cmd.arg("--system-prompt").arg(system_prompt);
        }

        if let Some(ref resume) = self.options.resume {
            cmd.arg("--resume").arg(resume);
        }
    }
}
