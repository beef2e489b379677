//! Mapping of CLI messages onto agent events

use serde_json::Value;

use crate::agent::{AgentEvent, CompactTrigger, StreamDelta, TurnResult};
use crate::types::messages::Message;

/// Translate one CLI message into the event the turn engine consumes
///
/// Returns `None` for messages that carry nothing the engine acts on:
/// echoed user messages, unrelated system notices, and partial-message
/// events from nested sub-agents.
#[must_use]
pub fn normalize(message: Message) -> Option<AgentEvent> {
    match message {
        Message::System { subtype, data } => match subtype.as_str() {
            "init" => Some(AgentEvent::Init {
                resume_token: string_field(&data, "session_id"),
                model: string_field(&data, "model"),
            }),
            "compact_boundary" => {
                Some(AgentEvent::CompactBoundary {
                    trigger: data
                        .pointer("/compact_metadata/trigger")
                        .and_then(Value::as_str)
                        .map_or(CompactTrigger::Auto, CompactTrigger::parse),
                    pre_tokens: data
                        .pointer("/compact_metadata/pre_tokens")
                        .and_then(Value::as_u64),
                })
            }
            other => {
                log::debug!("Ignoring system message {other}");
                None
            }
        },
        Message::StreamEvent {
            event,
            parent_tool_use_id,
        } => {
            if parent_tool_use_id.is_some() {
                return None;
            }
            stream_delta(&event).map(AgentEvent::Delta)
        }
        Message::Assistant { message, .. } => Some(AgentEvent::Assistant {
            blocks: message.content,
            model: message.model,
        }),
        Message::Result {
            subtype,
            is_error,
            usage,
            model_usage,
            result,
            ..
        } => Some(AgentEvent::Result(TurnResult {
            is_error,
            subtype,
            usage,
            model_usage,
            result,
        })),
        Message::User { .. } => None,
    }
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn stream_delta(event: &Value) -> Option<StreamDelta> {
    match event.get("type").and_then(Value::as_str)? {
        "content_block_start" => {
            let block_type = event.pointer("/content_block/type").and_then(Value::as_str);
            (block_type == Some("thinking")).then_some(StreamDelta::ThinkingStart)
        }
        "content_block_delta" => {
            let delta = event.get("delta")?;
            match delta.get("type").and_then(Value::as_str)? {
                "text_delta" => Some(StreamDelta::Text(string_field(delta, "text")?)),
                "thinking_delta" => Some(StreamDelta::Thinking(string_field(delta, "thinking")?)),
                "input_json_delta" => Some(StreamDelta::ToolInput(
                    delta
                        .get("partial_json")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                )),
                "signature_delta" => Some(StreamDelta::Signature),
                _ => None,
            }
        }
        _ => None,
    }
}
