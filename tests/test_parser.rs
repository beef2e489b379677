//! Parsing and normalization of Claude CLI stream-json output

use serde_json::{Value, json};

use kodegen_claude_relay::agent::{AgentEvent, CompactTrigger, StreamDelta};
use kodegen_claude_relay::message::{normalize, parse_message};
use kodegen_claude_relay::types::ContentBlock;
use kodegen_claude_relay::ClaudeError;

fn event(data: Value) -> Option<AgentEvent> {
    normalize(parse_message(data).unwrap())
}

fn delta(data: Value) -> Option<StreamDelta> {
    match event(data) {
        Some(AgentEvent::Delta(delta)) => Some(delta),
        None => None,
        Some(other) => panic!("expected a delta, got {other:?}"),
    }
}

fn stream_event(inner: Value) -> Value {
    json!({"type": "stream_event", "uuid": "u1", "session_id": "abc", "parent_tool_use_id": null, "event": inner})
}

#[test]
fn test_parse_invalid_message() {
    let err = parse_message(json!({"type": "invalid_type", "data": "some data"})).unwrap_err();
    assert!(matches!(err, ClaudeError::MessageParse { data: Some(_), .. }));
}

#[test]
fn test_init_carries_resume_token() {
    let init = event(json!({
        "type": "system",
        "subtype": "init",
        "session_id": "3f2c",
        "model": "claude-sonnet-4-5",
        "cwd": "/tmp",
        "tools": ["Bash", "Read"]
    }));
    match init {
        Some(AgentEvent::Init { resume_token, model }) => {
            assert_eq!(resume_token.as_deref(), Some("3f2c"));
            assert_eq!(model.as_deref(), Some("claude-sonnet-4-5"));
        }
        other => panic!("expected init, got {other:?}"),
    }
}

#[test]
fn test_compact_boundary() {
    let manual = event(json!({
        "type": "system",
        "subtype": "compact_boundary",
        "compact_metadata": {"trigger": "manual", "pre_tokens": 51234}
    }));
    assert!(matches!(
        manual,
        Some(AgentEvent::CompactBoundary {
            trigger: CompactTrigger::Manual,
            pre_tokens: Some(51234)
        })
    ));

    let bare = event(json!({"type": "system", "subtype": "compact_boundary"}));
    assert!(matches!(
        bare,
        Some(AgentEvent::CompactBoundary {
            trigger: CompactTrigger::Auto,
            pre_tokens: None
        })
    ));

    assert!(event(json!({"type": "system", "subtype": "hook_response"})).is_none());
}

#[test]
fn test_stream_deltas() {
    let text = delta(stream_event(json!({
        "type": "content_block_delta",
        "index": 0,
        "delta": {"type": "text_delta", "text": "Hello"}
    })));
    assert_eq!(text, Some(StreamDelta::Text("Hello".into())));

    let thinking_start = delta(stream_event(json!({
        "type": "content_block_start",
        "index": 0,
        "content_block": {"type": "thinking", "thinking": ""}
    })));
    assert_eq!(thinking_start, Some(StreamDelta::ThinkingStart));

    let thinking = delta(stream_event(json!({
        "type": "content_block_delta",
        "index": 0,
        "delta": {"type": "thinking_delta", "thinking": "Let me check"}
    })));
    assert_eq!(thinking, Some(StreamDelta::Thinking("Let me check".into())));

    let tool_input = delta(stream_event(json!({
        "type": "content_block_delta",
        "index": 1,
        "delta": {"type": "input_json_delta", "partial_json": "{\"comm"}
    })));
    assert_eq!(tool_input, Some(StreamDelta::ToolInput("{\"comm".into())));

    let text_start = delta(stream_event(json!({
        "type": "content_block_start",
        "index": 0,
        "content_block": {"type": "text", "text": ""}
    })));
    assert_eq!(text_start, None);
    assert_eq!(delta(stream_event(json!({"type": "message_stop"}))), None);
}

#[test]
fn test_nested_agent_partials_are_dropped() {
    let nested = json!({
        "type": "stream_event",
        "parent_tool_use_id": "toolu_task",
        "event": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": "inner"}}
    });
    assert!(event(nested).is_none());
}

#[test]
fn test_assistant_and_result() {
    let assistant = event(json!({
        "type": "assistant",
        "message": {
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "text", "text": "Running it"},
                {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "ls"}},
                {"type": "image", "source": {}}
            ]
        },
        "parent_tool_use_id": null,
        "session_id": "3f2c"
    }));
    match assistant {
        Some(AgentEvent::Assistant { blocks, model }) => {
            assert_eq!(model.as_deref(), Some("claude-sonnet-4-5"));
            assert_eq!(blocks.len(), 3);
            assert!(matches!(&blocks[1], ContentBlock::ToolUse { name, .. } if name == "Bash"));
            assert_eq!(blocks[2], ContentBlock::Unsupported);
        }
        other => panic!("expected assistant, got {other:?}"),
    }

    let result = event(json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "duration_ms": 1200,
        "num_turns": 1,
        "result": "done",
        "usage": {"input_tokens": 10, "output_tokens": 5},
        "modelUsage": {"claude-sonnet-4-5": {"inputTokens": 10, "outputTokens": 5, "contextWindow": 200000}}
    }));
    match result {
        Some(AgentEvent::Result(result)) => {
            assert!(!result.is_error);
            assert_eq!(result.subtype, "success");
            assert_eq!(result.result.as_deref(), Some("done"));
            assert!(result.model_usage.is_some());
        }
        other => panic!("expected result, got {other:?}"),
    }

    let echoed = event(json!({"type": "user", "message": {"role": "user", "content": "hi"}}));
    assert!(echoed.is_none());
}
