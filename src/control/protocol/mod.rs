//! Control protocol implementation for bidirectional communication
//!
//! The relay drives three outgoing requests (`initialize` with hook
//! registration, `interrupt`, `set_permission_mode`) and answers one kind of
//! incoming request (`hook_callback`). Every outgoing request is correlated
//! with its `control_response` by `request_id`.
//!
//! # Example: Building and answering requests
//!
//! ```rust
//! use kodegen_claude_relay::control::{ControlMessage, ProtocolHandler};
//! use kodegen_claude_relay::types::{HookOutput, RequestId};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handler = ProtocolHandler::new();
//!
//! let (id, line, _response) = handler.create_interrupt_request()?;
//! assert!(line.ends_with('\n'));
//! assert_eq!(handler.pending_count(), 1);
//!
//! let reply = ProtocolHandler::hook_reply(&RequestId::new("cli-7"), &HookOutput::allow())?;
//! let parsed: ControlMessage = serde_json::from_str(reply.trim())?;
//! assert!(matches!(parsed, ControlMessage::ControlResponse { .. }));
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

mod handler;
mod messages;

// Re-export public types
pub use handler::{
    CONTROL_REQUEST_TIMEOUT, ProtocolHandler, ResponseReceiver, SHELL_HOOK_CALLBACK_ID,
};
pub use messages::{ControlMessage, ControlRequest, ControlResponse};
