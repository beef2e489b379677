//! Error types for the Claude relay

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::identifiers::{BashId, SessionId};

/// Message fragments that identify a user-triggered abort
const ABORT_PATTERNS: &[&str] = &[
    "aborted by user",
    "interrupted by user",
    "request was aborted",
    "operation was aborted",
    "generation stopped",
];

/// Which watchdog ended a background wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFailure {
    /// Total elapsed time exceeded the wait budget
    Timeout,
    /// The process stayed alive without producing output
    Hang,
}

impl fmt::Display for WaitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Hang => f.write_str("stopped producing output"),
        }
    }
}

/// Main error type for the Claude relay
#[derive(Error, Debug)]
pub enum ClaudeError {
    /// Claude Code CLI not found or not installed
    #[error("Claude Code CLI not found: {0}")]
    CliNotFound(String),

    /// Connection error when communicating with Claude Code
    #[error("Connection error: {0}")]
    Connection(String),

    /// Process execution error with exit code and stderr
    #[error("Process error (exit code {exit_code}): {message}")]
    Process {
        /// Error message
        message: String,
        /// Process exit code
        exit_code: i32,
        /// Tail of the standard error output
        stderr: Option<String>,
    },

    /// JSON decode error when parsing CLI output
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),

    /// Message parse error with optional raw data
    #[error("Message parse error: {message}")]
    MessageParse {
        /// Error message
        message: String,
        /// Raw message data that failed to parse
        data: Option<serde_json::Value>,
    },

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Control protocol error
    #[error("Control protocol error: {0}")]
    ControlProtocol(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No stream is registered for the session
    #[error("No active stream for session {0}")]
    StreamNotFound(SessionId),

    /// Session unknown to the persistence layer
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The turn was cancelled by the user
    #[error("Aborted by user: {0}")]
    Aborted(String),

    /// Error reported by the agent itself, with its structured payload when present
    #[error("Agent error: {message}")]
    Agent {
        /// Human readable message
        message: String,
        /// Structured error body
        payload: Option<serde_json::Value>,
    },

    /// Background process management error
    #[error("Background process error: {0}")]
    BackgroundProcess(String),

    /// A background wait hit its total or no-output deadline
    #[error("Background process {bash_id} {kind} after {}s", elapsed.as_secs())]
    BackgroundTimeout {
        /// Process that was being waited on
        bash_id: BashId,
        /// Which deadline fired
        kind: WaitFailure,
        /// Time spent waiting
        elapsed: Duration,
        /// Output captured before the deadline
        output: String,
    },

    /// Persistence collaborator error
    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, ClaudeError>;

impl ClaudeError {
    /// Create a CLI not found error
    #[must_use]
    pub fn cli_not_found() -> Self {
        Self::CliNotFound(
            "Claude Code not found. Install with:\n\
             npm install -g @anthropic-ai/claude-code\n\
             \n\
             Or set agent.cli_path in the relay configuration"
                .to_string(),
        )
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a process error
    pub fn process(msg: impl Into<String>, exit_code: i32, stderr: Option<String>) -> Self {
        Self::Process {
            message: msg.into(),
            exit_code,
            stderr,
        }
    }

    /// Create a message parse error
    pub fn message_parse(msg: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self::MessageParse {
            message: msg.into(),
            data,
        }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a control protocol error
    pub fn control_protocol(msg: impl Into<String>) -> Self {
        Self::ControlProtocol(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a session not found error
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound(session_id.into())
    }

    /// Create an abort error
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    /// Create an agent error carrying the raw error body
    pub fn agent(msg: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self::Agent {
            message: msg.into(),
            payload,
        }
    }

    /// Create a background process error
    pub fn background(msg: impl Into<String>) -> Self {
        Self::BackgroundProcess(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Whether this error represents a user-triggered abort
    ///
    /// Aborts are recognised before any retry classification happens and are
    /// never treated as failures.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        if matches!(self, Self::Aborted(_)) {
            return true;
        }
        let text = self.to_string().to_lowercase();
        ABORT_PATTERNS.iter().any(|pattern| text.contains(pattern))
    }

    /// Structured error body, if the failure carried one
    #[must_use]
    pub fn payload(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Agent { payload, .. } => payload.as_ref(),
            Self::MessageParse { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    /// Captured stderr, if the failure came from a subprocess
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Process { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}
