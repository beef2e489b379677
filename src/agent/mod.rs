//! Agent invocation seam
//!
//! The turn engine never talks to a subprocess directly. It asks an
//! [`AgentLauncher`] for an [`AgentInvocation`], pulls normalized
//! [`AgentEvent`]s from it, and steers it mid-turn through
//! [`InvocationControl`]. The production launcher wraps the Claude CLI
//! (see [`crate::client`]); tests script one.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::manager::InboundMessages;
use crate::types::messages::ContentBlock;
use crate::types::permissions::PermissionMode;
use crate::types::identifiers::SessionId;

/// Everything needed to start one invocation
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Session being served
    pub session_id: SessionId,
    /// Directory the agent works in
    pub working_directory: PathBuf,
    /// Model override
    pub model: Option<String>,
    /// System prompt override
    pub system_prompt: Option<String>,
    /// Resume token from a previous invocation of this session
    pub resume_token: Option<String>,
    /// Mode the invocation starts in
    pub permission_mode: PermissionMode,
    /// Session-wide cancellation signal
    pub abort: CancellationToken,
    /// Prompts to feed the agent, in order; ends when the stream is cleaned up
    pub prompts: InboundMessages,
}

/// Starts agent invocations
pub trait AgentLauncher: Send + Sync {
    /// Spawn an invocation for `request`
    fn launch(&self, request: LaunchRequest) -> BoxFuture<'_, Result<Box<dyn AgentInvocation>>>;
}

/// A running agent invocation
pub trait AgentInvocation: Send {
    /// Next event; `None` once the invocation has finished
    ///
    /// Must be cancel-safe: dropping the returned future before it resolves
    /// may not lose an event.
    fn next_event(&mut self) -> BoxFuture<'_, Option<Result<AgentEvent>>>;

    /// Handle for steering the invocation from outside the drain loop
    fn control(&self) -> Arc<dyn InvocationControl>;
}

/// Mid-turn operations on a live invocation
pub trait InvocationControl: Send + Sync {
    /// Switch permission mode without restarting
    fn set_permission_mode(&self, mode: PermissionMode) -> BoxFuture<'_, Result<()>>;

    /// Ask the agent to stop the current turn
    fn interrupt(&self) -> BoxFuture<'_, Result<()>>;
}

/// How a compaction was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactTrigger {
    /// The agent compacted on its own
    Auto,
    /// The user asked for it
    Manual,
}

impl CompactTrigger {
    /// Parse the trigger string reported by the agent; unknown values count as automatic
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("manual") {
            Self::Manual
        } else {
            Self::Auto
        }
    }
}

/// Incremental content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    /// Assistant text
    Text(String),
    /// A reasoning block opened
    ThinkingStart,
    /// Reasoning text
    Thinking(String),
    /// Partial JSON of a tool call's input
    ToolInput(String),
    /// Reasoning signature; metadata only
    Signature,
}

/// Turn completion data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnResult {
    /// Whether the agent reported the turn as failed
    pub is_error: bool,
    /// Result subtype, e.g. `success`
    pub subtype: String,
    /// Aggregate token usage
    pub usage: Option<Value>,
    /// Per-model usage keyed by model id
    pub model_usage: Option<Value>,
    /// Final text, if any
    pub result: Option<String>,
}

/// What the engine decides about an intercepted tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolVerdict {
    /// Run the tool unchanged
    Allow,
    /// Do not run the tool; report this output and exit code as its result
    Substitute {
        /// Output the agent should observe
        output: String,
        /// Exit code the agent should observe
        exit_code: i32,
    },
    /// Refuse the call
    Deny {
        /// Reason shown to the agent
        reason: String,
    },
}

/// A tool call paused until the engine answers through `responder`
#[derive(Debug)]
pub struct PendingToolCall {
    /// Tool-use id, when the agent supplied one
    pub tool_use_id: Option<String>,
    /// Tool name, e.g. `Bash`
    pub tool_name: String,
    /// Raw tool input
    pub input: Value,
    /// Where the verdict goes; dropping it counts as `Allow`
    pub responder: oneshot::Sender<ToolVerdict>,
}

impl PendingToolCall {
    /// Answer the call; a closed responder is logged and ignored
    pub fn respond(self, verdict: ToolVerdict) {
        if self.responder.send(verdict).is_err() {
            log::debug!("tool call {} no longer awaiting a verdict", self.tool_name);
        }
    }
}

/// Normalized agent event
#[derive(Debug)]
pub enum AgentEvent {
    /// The invocation started; carries its resume token
    Init {
        /// Token that continues this conversation in a later invocation
        resume_token: Option<String>,
        /// Model in use
        model: Option<String>,
    },
    /// Conversation history was compacted
    CompactBoundary {
        /// Who triggered it
        trigger: CompactTrigger,
        /// Tokens before compaction, when reported
        pre_tokens: Option<u64>,
    },
    /// Streaming content
    Delta(StreamDelta),
    /// A complete assistant message
    Assistant {
        /// Content blocks
        blocks: Vec<ContentBlock>,
        /// Model that produced it
        model: Option<String>,
    },
    /// A tool call awaiting a verdict
    ToolRequest(PendingToolCall),
    /// The turn finished
    Result(TurnResult),
}
