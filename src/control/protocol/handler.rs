//! Protocol handler for managing control protocol communication

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{ClaudeError, Result};
use crate::hooks::SHELL_TOOL;
use crate::types::hooks::HookOutput;
use crate::types::identifiers::RequestId;
use crate::types::permissions::PermissionMode;

use super::messages::{ControlMessage, ControlRequest, ControlResponse};

/// How long an outgoing control request may wait for its response
pub const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback id of the single `PreToolUse` hook the relay registers
pub const SHELL_HOOK_CALLBACK_ID: &str = "hook_0";

type ResponseSender = oneshot::Sender<Result<Option<Value>>>;

/// Receives the outcome of one outgoing request
pub type ResponseReceiver = oneshot::Receiver<Result<Option<Value>>>;

/// Correlates outgoing control requests with their responses
pub struct ProtocolHandler {
    next_request_id: AtomicU64,
    pending_requests: Mutex<HashMap<RequestId, ResponseSender>>,
}

impl ProtocolHandler {
    /// Create a new protocol handler
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_request_id: AtomicU64::new(1),
            pending_requests: Mutex::new(HashMap::new()),
        }
    }

    /// Generate next request ID
    #[must_use]
    pub fn next_id(&self) -> RequestId {
        let n = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let suffix = Uuid::new_v4().simple().to_string();
        RequestId::new(format!("req_{n}_{}", &suffix[..8]))
    }

    /// Number of requests still awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_requests.lock().len()
    }

    /// Register `request` as pending and serialize it
    ///
    /// Returns the request id, the line to write to the CLI, and a receiver
    /// for the response.
    ///
    /// # Errors
    /// Returns error if the request cannot be serialized
    pub fn request(&self, request: ControlRequest) -> Result<(RequestId, String, ResponseReceiver)> {
        let request_id = self.next_id();
        let line = Self::serialize_message(&ControlMessage::ControlRequest {
            request_id: request_id.clone(),
            request,
        })?;
        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().insert(request_id.clone(), tx);
        Ok((request_id, line, rx))
    }

    /// `initialize` request registering the shell `PreToolUse` hook
    ///
    /// # Errors
    /// Returns error if the request cannot be serialized
    pub fn create_initialize_request(&self) -> Result<(RequestId, String, ResponseReceiver)> {
        self.request(ControlRequest::Initialize {
            hooks: Some(json!({
                "PreToolUse": [{
                    "matcher": SHELL_TOOL,
                    "hookCallbackIds": [SHELL_HOOK_CALLBACK_ID],
                }]
            })),
        })
    }

    /// `interrupt` request
    ///
    /// # Errors
    /// Returns error if the request cannot be serialized
    pub fn create_interrupt_request(&self) -> Result<(RequestId, String, ResponseReceiver)> {
        self.request(ControlRequest::Interrupt)
    }

    /// `set_permission_mode` request
    ///
    /// # Errors
    /// Returns error if the request cannot be serialized
    pub fn create_set_permission_mode_request(
        &self,
        mode: PermissionMode,
    ) -> Result<(RequestId, String, ResponseReceiver)> {
        self.request(ControlRequest::SetPermissionMode { mode })
    }

    /// Resolve the pending request `response` answers
    ///
    /// Returns `false` when nothing was waiting for it.
    pub fn handle_response(&self, response: ControlResponse) -> bool {
        let Some(tx) = self.pending_requests.lock().remove(response.request_id()) else {
            log::debug!(
                "Control response for unknown request {}",
                response.request_id()
            );
            return false;
        };
        let outcome = match response {
            ControlResponse::Success { response, .. } => Ok(response),
            ControlResponse::Error { error, .. } => Err(ClaudeError::control_protocol(error)),
        };
        let _ = tx.send(outcome);
        true
    }

    /// Wait for the response to `request_id`, giving up after
    /// [`CONTROL_REQUEST_TIMEOUT`]
    ///
    /// # Errors
    /// Returns error if the CLI reported failure, went away, or did not answer in time
    pub async fn await_response(
        &self,
        request_id: &RequestId,
        rx: ResponseReceiver,
    ) -> Result<Option<Value>> {
        match tokio::time::timeout(CONTROL_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClaudeError::control_protocol(format!(
                "Claude CLI closed before answering {request_id}"
            ))),
            Err(_) => {
                self.forget(request_id);
                Err(ClaudeError::timeout(format!(
                    "No control response to {request_id} within {}s",
                    CONTROL_REQUEST_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Drop a pending request without resolving it
    pub fn forget(&self, request_id: &RequestId) {
        self.pending_requests.lock().remove(request_id);
    }

    /// Fail every pending request, e.g. because the CLI exited
    pub fn fail_pending(&self, reason: &str) {
        let pending: Vec<_> = self.pending_requests.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(ClaudeError::control_protocol(reason.to_string())));
        }
    }

    /// Reply to a `hook_callback` request
    ///
    /// # Errors
    /// Returns error if the reply cannot be serialized
    pub fn hook_reply(request_id: &RequestId, output: &HookOutput) -> Result<String> {
        Self::serialize_message(&ControlMessage::ControlResponse {
            response: ControlResponse::Success {
                request_id: request_id.clone(),
                response: Some(serde_json::to_value(output)?),
            },
        })
    }

    /// Refuse an incoming request the relay does not serve
    ///
    /// # Errors
    /// Returns error if the reply cannot be serialized
    pub fn error_reply(request_id: &RequestId, error: impl Into<String>) -> Result<String> {
        Self::serialize_message(&ControlMessage::ControlResponse {
            response: ControlResponse::Error {
                request_id: request_id.clone(),
                error: error.into(),
            },
        })
    }

    /// Serialize control message to a JSON line
    ///
    /// # Errors
    /// Returns error if JSON serialization fails
    pub fn serialize_message(message: &ControlMessage) -> Result<String> {
        serde_json::to_string(message)
            .map(|s| format!("{s}\n"))
            .map_err(ClaudeError::from)
    }

    /// Interpret `value` as a control message
    ///
    /// Returns `None` for conversation messages, which carry a non-`control_`
    /// type.
    pub fn parse_control(value: &Value) -> Option<Result<ControlMessage>> {
        let kind = value.get("type").and_then(Value::as_str)?;
        if !kind.starts_with("control_") {
            return None;
        }
        Some(serde_json::from_value(value.clone()).map_err(|e| {
            ClaudeError::message_parse(format!("Invalid control message: {e}"), Some(value.clone()))
        }))
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}
