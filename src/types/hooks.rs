//! Hook-related type definitions
//!
//! The relay registers a single `PreToolUse` hook for the shell tool and
//! answers every callback with one of these outputs.

use serde::{Deserialize, Serialize};

use super::permissions::PermissionDecision;

// ============================================================================
// Hook Types
// ============================================================================

/// Hook event types the relay registers for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    /// Before a tool is used
    PreToolUse,
}

/// Event-specific payload of a `PreToolUse` hook reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreToolUseOutput {
    /// Always [`HookEvent::PreToolUse`]
    pub hook_event_name: HookEvent,
    /// Allow or deny
    pub permission_decision: PermissionDecision,
    /// Reason shown to the model on deny
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_decision_reason: Option<String>,
    /// Replacement tool input on allow
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<serde_json::Value>,
}

/// Hook output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookOutput {
    /// Hook-specific output data
    #[serde(skip_serializing_if = "Option::is_none", rename = "hookSpecificOutput")]
    pub hook_specific_output: Option<PreToolUseOutput>,
}

impl HookOutput {
    /// Let the tool run unchanged
    #[must_use]
    pub fn allow() -> Self {
        Self::default()
    }

    /// Let the tool run with rewritten input
    #[must_use]
    pub fn allow_with_input(updated_input: serde_json::Value) -> Self {
        Self {
            hook_specific_output: Some(PreToolUseOutput {
                hook_event_name: HookEvent::PreToolUse,
                permission_decision: PermissionDecision::Allow,
                permission_decision_reason: None,
                updated_input: Some(updated_input),
            }),
        }
    }

    /// Refuse the tool call
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            hook_specific_output: Some(PreToolUseOutput {
                hook_event_name: HookEvent::PreToolUse,
                permission_decision: PermissionDecision::Deny,
                permission_decision_reason: Some(reason.into()),
                updated_input: None,
            }),
        }
    }
}
