//! Message parser for Claude Code CLI output

use crate::error::{ClaudeError, Result};
use crate::types::messages::Message;

/// Parse a JSON value into a typed Message
///
/// # Errors
/// Returns `ClaudeError::MessageParse` if the JSON cannot be parsed into a valid Message
pub fn parse_message(data: serde_json::Value) -> Result<Message> {
    serde_json::from_value(data.clone()).map_err(|e| {
        ClaudeError::message_parse(format!("Failed to parse message: {e}"), Some(data))
    })
}
