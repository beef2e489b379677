//! Persisted session records
//!
//! These are the shapes exchanged with the persistence collaborator. The relay
//! never sees how they are stored.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identifiers::SessionId;
use super::permissions::PermissionMode;

/// A persisted conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Session identifier
    pub id: SessionId,
    /// Display title
    pub title: String,
    /// Directory the agent runs in
    pub working_directory: PathBuf,
    /// Current permission mode
    pub permission_mode: PermissionMode,
    /// Free-form conversation mode (e.g. "coding", "planning")
    pub conversation_mode: Option<String>,
    /// Agent-side token used to continue the conversation in a new process
    pub resume_token: Option<String>,
    /// Most recent context-window usage
    pub context_usage: Option<ContextUsage>,
}

impl SessionRecord {
    /// New session rooted at `working_directory` with default settings
    pub fn new(id: impl Into<SessionId>, working_directory: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            title: id.to_string(),
            id,
            working_directory: working_directory.into(),
            permission_mode: PermissionMode::Default,
            conversation_mode: None,
            resume_token: None,
            context_usage: None,
        }
    }

    /// Builder-style permission mode override
    #[must_use]
    pub const fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }
}

/// Where a [`ContextUsage`] figure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    /// Per-model entry matching the session's model
    ExactModel,
    /// First per-model entry; the reported model id did not match
    FirstModelEntry,
    /// Aggregate usage block with the default context window
    Aggregate,
    /// Estimated from turn length; no usage was reported
    Estimated,
}

/// Context-window consumption after a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    /// Input tokens including cache reads and writes
    pub input_tokens: u64,
    /// Output tokens
    pub output_tokens: u64,
    /// Size of the model's context window
    pub context_window: u64,
    /// `input_tokens / context_window`, as a percentage
    pub context_percentage: f64,
    /// Provenance of the numbers
    pub source: UsageSource,
}

/// Author of a persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Sent by the client
    User,
    /// Produced by the agent
    Assistant,
    /// Produced by the relay (compaction dividers)
    System,
}

/// A persisted conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Author
    pub role: MessageRole,
    /// Plain text content
    pub content: String,
    /// Structured content blocks, serialized
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<serde_json::Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Message with no structured blocks
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            blocks: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(MessageRole::User, content)
    }
}
