//! Claude CLI agent launcher
//!
//! [`ClaudeCliLauncher`] is the production [`AgentLauncher`]: each launch
//! spawns one Claude Code CLI process in bidirectional stream-json mode and
//! wraps it as a [`ClaudeCliInvocation`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ClaudeCliInvocation                      │
//! │                                                              │
//! │  session queue ──► prompt task ──┐                           │
//! │                                  ├──► writer task ──► stdin  │
//! │  hook verdicts ──────────────────┤                           │
//! │  InvocationControl ──────────────┘                           │
//! │                                                              │
//! │  stdout ──► reader task ──► AgentEvent channel ──► engine    │
//! │                 │                                            │
//! │                 └──► control responses ──► ProtocolHandler   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything written to the CLI goes through the single writer task, so
//! prompts, hook replies, and control requests never interleave mid-line.
//! Dropping the invocation aborts its tasks and kills the process.

mod client_impl;
mod tasks;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::agent::{AgentEvent, AgentInvocation, AgentLauncher, InvocationControl, LaunchRequest};
use crate::config::{AgentSettings, RelayConfig};
use crate::control::{ProtocolHandler, ResponseReceiver};
use crate::error::{ClaudeError, Result};
use crate::transport::SubprocessTransport;
use crate::types::identifiers::{RequestId, SessionId};
use crate::types::permissions::PermissionMode;

/// Starts one Claude CLI process per invocation
#[derive(Debug, Clone, Default)]
pub struct ClaudeCliLauncher {
    settings: AgentSettings,
}

impl ClaudeCliLauncher {
    /// Launcher using `settings` for every spawn
    #[must_use]
    pub const fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    /// Launcher configured from the relay's `agent` settings
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.agent.clone())
    }
}

impl AgentLauncher for ClaudeCliLauncher {
    fn launch(&self, request: LaunchRequest) -> BoxFuture<'_, Result<Box<dyn AgentInvocation>>> {
        Box::pin(async move {
            let invocation = ClaudeCliInvocation::start(&self.settings, request).await?;
            Ok(Box::new(invocation) as Box<dyn AgentInvocation>)
        })
    }
}

/// What the writer task puts on the CLI's stdin
#[derive(Debug)]
enum WriterCommand {
    /// One newline-terminated JSON line
    Line(String),
    /// Close stdin; the CLI finishes its current turn and exits
    EndInput,
}

/// A running Claude CLI process
pub struct ClaudeCliInvocation {
    session_id: SessionId,
    #[allow(dead_code)] // owns the process; dropped with the invocation
    transport: Arc<Mutex<SubprocessTransport>>,
    events: mpsc::UnboundedReceiver<Result<AgentEvent>>,
    control: Arc<CliControl>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentInvocation for ClaudeCliInvocation {
    fn next_event(&mut self) -> BoxFuture<'_, Option<Result<AgentEvent>>> {
        Box::pin(self.events.recv())
    }

    fn control(&self) -> Arc<dyn InvocationControl> {
        self.control.clone()
    }
}

impl Drop for ClaudeCliInvocation {
    fn drop(&mut self) {
        log::debug!("[{}] Closing Claude CLI invocation", self.session_id);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Control requests sent through the writer task
struct CliControl {
    protocol: Arc<ProtocolHandler>,
    writer: mpsc::UnboundedSender<WriterCommand>,
}

impl CliControl {
    async fn call(
        &self,
        (request_id, line, response): (RequestId, String, ResponseReceiver),
    ) -> Result<Option<Value>> {
        if self.writer.send(WriterCommand::Line(line)).is_err() {
            self.protocol.forget(&request_id);
            return Err(ClaudeError::transport("Claude CLI input is closed"));
        }
        self.protocol.await_response(&request_id, response).await
    }
}

impl InvocationControl for CliControl {
    fn set_permission_mode(&self, mode: PermissionMode) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let request = self.protocol.create_set_permission_mode_request(mode)?;
            self.call(request).await.map(|_| ())
        })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let request = self.protocol.create_interrupt_request()?;
            self.call(request).await.map(|_| ())
        })
    }
}
