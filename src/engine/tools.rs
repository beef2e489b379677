//! Shell tool interception
//!
//! Explicit background commands are spawned detached and answered at once.
//! Long-running foreground commands are spawned the same way, but the tool
//! call stays blocked until the process exits, hangs, or times out, and the
//! captured output is handed back as the tool's result.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::{PendingToolCall, ToolVerdict};
use crate::background::{BackgroundProcess, SpawnOutcome, WaitOptions};
use crate::error::ClaudeError;
use crate::hooks::ToolCall;
use crate::types::events::ProtocolEvent;
use crate::types::identifiers::BashId;

use super::{TurnContext, TurnProtocolEngine};

/// Exit code reported to the agent when a long-running command is cut short
const TIMED_OUT_EXIT_CODE: i32 = 124;

impl TurnProtocolEngine {
    pub(super) fn intercept(&self, ctx: &TurnContext, call: PendingToolCall) {
        match ToolCall::classify(&call.tool_name, &call.input) {
            ToolCall::Other | ToolCall::ShellOrdinary => call.respond(ToolVerdict::Allow),
            ToolCall::ShellBackground {
                command,
                description,
            } => self.start_background(ctx, call, &command, description.as_deref()),
            ToolCall::ShellLongRunning { command } => self.start_long_running(ctx, call, &command),
        }
    }

    fn start_background(
        &self,
        ctx: &TurnContext,
        call: PendingToolCall,
        command: &str,
        description: Option<&str>,
    ) {
        let session_id = &ctx.session_id;
        let outcome = match self.background.spawn(
            command,
            &ctx.working_directory,
            BashId::generate(),
            session_id,
            description,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("[{session_id}] background spawn failed: {e}");
                call.respond(ToolVerdict::Substitute {
                    output: format!("Failed to start background command: {e}"),
                    exit_code: 1,
                });
                return;
            }
        };

        let existing = outcome.is_existing();
        let process = outcome.process().clone();
        self.streams.safe_send(session_id, &ProtocolEvent::BackgroundProcessStarted {
            bash_id: process.bash_id.clone(),
            command: process.command.clone(),
            description: process.description.clone(),
            pid: process.pid,
            existing,
        });

        let output = if existing {
            format!(
                "This command is already running in the background (id {}, pid {}); reusing it instead of starting another copy.",
                process.bash_id, process.pid
            )
        } else {
            format!(
                "Command started in the background (id {}, pid {}). Output is being written to {}.",
                process.bash_id,
                process.pid,
                process.log_path.display()
            )
        };
        call.respond(ToolVerdict::Substitute {
            output,
            exit_code: 0,
        });

        if let SpawnOutcome::Spawned(process) = outcome {
            self.watch_exit(process);
        }
    }

    /// Tell the owning session when a background process exits on its own
    fn watch_exit(&self, process: BackgroundProcess) {
        let background = Arc::clone(&self.background);
        let streams = Arc::clone(&self.streams);
        tokio::spawn(async move {
            let options = WaitOptions::default().unbounded().discard_output();
            match background.wait_for_completion(&process.bash_id, options).await {
                Ok(done) => {
                    log::info!(
                        "[{}] background process {} exited with {:?}",
                        process.session_id,
                        done.bash_id,
                        done.exit_code
                    );
                    streams.safe_send(&process.session_id, &ProtocolEvent::BackgroundProcessExited {
                        bash_id: done.bash_id,
                        exit_code: done.exit_code,
                    });
                }
                Err(e) => log::debug!(
                    "[{}] stopped watching {}: {e}",
                    process.session_id,
                    process.bash_id
                ),
            }
        });
    }

    fn start_long_running(&self, ctx: &TurnContext, call: PendingToolCall, command: &str) {
        let session_id = ctx.session_id.clone();
        let process = match self.background.spawn_exclusive(
            command,
            &ctx.working_directory,
            BashId::generate(),
            &session_id,
        ) {
            Ok(process) => process,
            Err(e) => {
                log::warn!("[{session_id}] long-running spawn failed, running inline: {e}");
                call.respond(ToolVerdict::Allow);
                return;
            }
        };

        let bash_id = process.bash_id.clone();
        log::info!("[{session_id}] long-running command {bash_id}: {command}");
        self.streams.safe_send(&session_id, &ProtocolEvent::LongRunningCommandStarted {
            bash_id: bash_id.clone(),
            command: command.to_string(),
        });

        let settings = self.background.settings();
        let options = {
            let streams = Arc::clone(&self.streams);
            let session_id = session_id.clone();
            let bash_id = bash_id.clone();
            let timeout = Arc::downgrade(&ctx.timeout);
            WaitOptions::default()
                .timeout(Duration::from_secs(settings.long_running_timeout_secs))
                .hang_timeout(Duration::from_secs(settings.long_running_hang_secs))
                .on_output(move |chunk| {
                    if let Some(timeout) = timeout.upgrade() {
                        timeout.reset();
                    }
                    streams.touch(&session_id);
                    streams.safe_send(&session_id, &ProtocolEvent::CommandOutputChunk {
                        bash_id: bash_id.clone(),
                        output: chunk.to_string(),
                    });
                })
        };

        let background = Arc::clone(&self.background);
        let streams = Arc::clone(&self.streams);
        let abort = ctx.abort.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = abort.cancelled() => {
                    background.kill(&bash_id).await;
                    call.respond(ToolVerdict::Deny {
                        reason: "Generation was stopped before the command finished".to_string(),
                    });
                }
                waited = background.wait_for_completion(&bash_id, options) => match waited {
                    Ok(done) => {
                        streams.safe_send(&session_id, &ProtocolEvent::LongRunningCommandCompleted {
                            bash_id: bash_id.clone(),
                            exit_code: done.exit_code,
                        });
                        call.respond(ToolVerdict::Substitute {
                            output: done.output,
                            exit_code: done.exit_code.unwrap_or(1),
                        });
                    }
                    Err(e) => {
                        background.kill(&bash_id).await;
                        let reason = e.to_string();
                        log::warn!("[{session_id}] long-running command failed: {reason}");
                        streams.safe_send(&session_id, &ProtocolEvent::LongRunningCommandFailed {
                            bash_id: bash_id.clone(),
                            error: reason.clone(),
                        });
                        let output = match e {
                            ClaudeError::BackgroundTimeout { output, .. } if !output.is_empty() => {
                                format!("{output}\n\n[{reason}; the process was killed]")
                            }
                            _ => format!("[{reason}]"),
                        };
                        call.respond(ToolVerdict::Substitute {
                            output,
                            exit_code: TIMED_OUT_EXIT_CODE,
                        });
                    }
                },
            }
        });
    }
}
