//! Client-facing protocol
//!
//! [`ProtocolEvent`] is everything the relay sends to a session's connection;
//! [`ClientMessage`] is everything a connection may send in.

use serde::{Deserialize, Serialize};

use super::identifiers::{BashId, SessionId};
use super::permissions::PermissionMode;

// ============================================================================
// Outbound
// ============================================================================

/// Events delivered over a session's connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProtocolEvent {
    /// Streamed assistant text delta
    AssistantMessage {
        /// Text fragment
        content: String,
    },
    /// A reasoning block began
    ThinkingStart,
    /// Streamed reasoning delta
    ThinkingDelta {
        /// Reasoning fragment
        content: String,
    },
    /// The agent invoked a tool
    ToolUse {
        /// Tool use id
        tool_id: String,
        /// Tool name
        tool_name: String,
        /// Tool input
        tool_input: serde_json::Value,
    },
    /// The agent finished planning and wants approval
    ExitPlanMode {
        /// Proposed plan
        plan: String,
    },
    /// Turn completed
    Result {
        /// False when the agent reported an error result
        success: bool,
    },
    /// Unrecoverable turn failure
    Error {
        /// Human readable message
        message: String,
        /// Classified error kind
        #[serde(skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
        /// Upstream correlation id
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// A failed attempt will be retried after `delay_ms`
    RetryAttempt {
        /// Attempt about to run
        attempt: u32,
        /// Attempt budget
        max_attempts: u32,
        /// Backoff before the attempt
        delay_ms: u64,
        /// Classified kind of the failure
        error_type: String,
    },
    /// No progress for a while
    TimeoutWarning {
        /// Seconds since the last progress
        elapsed_seconds: u64,
    },
    /// Context consumption after a turn
    ContextUsage {
        /// Input tokens, cache included
        input_tokens: u64,
        /// Output tokens
        output_tokens: u64,
        /// Model context window
        context_window: u64,
        /// Percentage of the window used
        context_percentage: f64,
    },
    /// Automatic compaction started; the agent keeps responding
    CompactStart,
    /// Manual compaction requested
    CompactLoading,
    /// Manual compaction finished
    CompactComplete,
    /// A detached process was launched (or an identical one reused)
    BackgroundProcessStarted {
        /// Process id in the relay registry
        bash_id: BashId,
        /// Command text
        command: String,
        /// Short description supplied by the agent
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// OS process id
        pid: u32,
        /// True when an identical running command was reused
        existing: bool,
    },
    /// A detached process was killed on request
    BackgroundProcessKilled {
        /// Process id in the relay registry
        bash_id: BashId,
    },
    /// A detached process exited on its own
    BackgroundProcessExited {
        /// Process id in the relay registry
        bash_id: BashId,
        /// Exit code, when the process was not signalled
        exit_code: Option<i32>,
    },
    /// A long-running command was diverted to a tracked process
    LongRunningCommandStarted {
        /// Process id in the relay registry
        bash_id: BashId,
        /// Command text
        command: String,
    },
    /// Output appended by a long-running command
    CommandOutputChunk {
        /// Process id in the relay registry
        bash_id: BashId,
        /// New output
        output: String,
    },
    /// A long-running command exited
    LongRunningCommandCompleted {
        /// Process id in the relay registry
        bash_id: BashId,
        /// Exit code, when the process was not signalled
        exit_code: Option<i32>,
    },
    /// A long-running command hung, timed out, or could not be tracked
    LongRunningCommandFailed {
        /// Process id in the relay registry
        bash_id: BashId,
        /// Failure description
        error: String,
    },
    /// The user stopped the current generation
    GenerationStopped,
    /// Session permission mode changed
    PermissionModeChanged {
        /// New mode
        mode: PermissionMode,
    },
    /// Periodic heartbeat during a turn
    Keepalive {
        /// Seconds since the turn started
        elapsed_seconds: u64,
    },
}

/// A [`ProtocolEvent`] tagged with its session
#[derive(Debug, Serialize)]
pub struct OutboundEnvelope<'a> {
    /// Owning session
    #[serde(rename = "sessionId")]
    pub session_id: &'a SessionId,
    /// Event payload
    #[serde(flatten)]
    pub event: &'a ProtocolEvent,
}

// ============================================================================
// Inbound
// ============================================================================

/// Control messages accepted from a client connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Send a user prompt
    Chat {
        /// Prompt text
        content: String,
        /// Target session
        session_id: SessionId,
        /// Model override for a fresh spawn
        #[serde(default)]
        model: Option<String>,
    },
    /// Abort the current turn
    StopGeneration {
        /// Target session
        session_id: SessionId,
    },
    /// Change the permission mode, live if an agent is running
    SetPermissionMode {
        /// Target session
        session_id: SessionId,
        /// New mode
        mode: PermissionMode,
    },
    /// Accept the proposed plan and continue with full permissions
    ApprovePlan {
        /// Target session
        session_id: SessionId,
    },
    /// Kill a tracked background process
    KillBackgroundProcess {
        /// Process to kill
        bash_id: BashId,
    },
}

impl ClientMessage {
    /// Session the message addresses, if any
    #[must_use]
    pub const fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Chat { session_id, .. }
            | Self::StopGeneration { session_id }
            | Self::SetPermissionMode { session_id, .. }
            | Self::ApprovePlan { session_id } => Some(session_id),
            Self::KillBackgroundProcess { .. } => None,
        }
    }
}
