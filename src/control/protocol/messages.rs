//! Control protocol message types
//!
//! Wire shapes of the `control_request` / `control_response` envelopes the
//! Claude CLI exchanges over stream-json.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::identifiers::RequestId;
use crate::types::permissions::PermissionMode;

/// Control message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// A request, in either direction
    ControlRequest {
        /// Correlation id
        request_id: RequestId,
        /// Request body
        request: ControlRequest,
    },
    /// A response, in either direction
    ControlResponse {
        /// Response body
        response: ControlResponse,
    },
    /// The CLI withdrew one of its own requests
    ControlCancelRequest {
        /// Request being withdrawn
        #[serde(default)]
        request_id: Option<RequestId>,
    },
}

/// Request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Start the session and register hook callbacks
    Initialize {
        /// Hook registrations keyed by event name
        #[serde(skip_serializing_if = "Option::is_none")]
        hooks: Option<Value>,
    },
    /// Stop the current turn
    Interrupt,
    /// Switch permission mode mid-session
    SetPermissionMode {
        /// New mode
        mode: PermissionMode,
    },
    /// A registered hook fired
    HookCallback {
        /// Callback id assigned at registration
        callback_id: String,
        /// Hook input (`tool_name`, `tool_input`, ...)
        #[serde(default)]
        input: Value,
        /// Tool use that triggered the hook
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    /// Request kinds the relay does not serve
    #[serde(other)]
    Unsupported,
}

/// Response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponse {
    /// The request succeeded
    Success {
        /// Request being answered
        request_id: RequestId,
        /// Optional payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    /// The request failed
    Error {
        /// Request being answered
        request_id: RequestId,
        /// What went wrong
        error: String,
    },
}

impl ControlResponse {
    /// Request this response answers
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Success { request_id, .. } | Self::Error { request_id, .. } => request_id,
        }
    }
}
