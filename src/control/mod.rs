//! Claude CLI control protocol
//!
//! Requests and responses that share stdin/stdout with the conversation
//! itself, distinguished by their `control_*` message type.

pub mod protocol;

pub use protocol::{
    CONTROL_REQUEST_TIMEOUT, ControlMessage, ControlRequest, ControlResponse, ProtocolHandler,
    ResponseReceiver, SHELL_HOOK_CALLBACK_ID,
};
