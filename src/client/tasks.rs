//! Background tasks for `ClaudeCliInvocation`
//!
//! One task owns writes to the CLI, one reads and dispatches its output, and
//! one feeds the session's queued prompts in as user messages.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentEvent, PendingToolCall, ToolVerdict};
use crate::control::{ControlMessage, ControlRequest, ProtocolHandler};
use crate::error::Result;
use crate::hooks::hook_output_for;
use crate::manager::InboundMessages;
use crate::message::{normalize, parse_message};
use crate::transport::{SubprocessTransport, Transport};
use crate::types::identifiers::{RequestId, SessionId};

use super::{ClaudeCliInvocation, WriterCommand};

type EventSender = mpsc::UnboundedSender<Result<AgentEvent>>;

impl ClaudeCliInvocation {
    /// Write commands to the CLI in arrival order
    pub(super) async fn writer_task(
        session_id: SessionId,
        transport: Arc<Mutex<SubprocessTransport>>,
        mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    ) {
        while let Some(command) = commands.recv().await {
            let mut transport = transport.lock().await;
            match command {
                WriterCommand::Line(line) => {
                    if let Err(e) = transport.write(&line).await {
                        log::warn!("[{session_id}] Write to Claude CLI failed: {e}");
                        break;
                    }
                }
                WriterCommand::EndInput => {
                    if let Err(e) = transport.end_input().await {
                        log::debug!("[{session_id}] Closing Claude CLI stdin failed: {e}");
                    }
                }
            }
        }
    }

    /// Dispatch CLI output: control traffic to the protocol handler,
    /// conversation messages to the engine as events
    pub(super) async fn reader_task(
        session_id: SessionId,
        mut messages: mpsc::UnboundedReceiver<Result<Value>>,
        protocol: Arc<ProtocolHandler>,
        writer: mpsc::UnboundedSender<WriterCommand>,
        events: EventSender,
    ) {
        while let Some(item) = messages.recv().await {
            let value = match item {
                Ok(value) => value,
                Err(e) => {
                    if events.send(Err(e)).is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Some(control) = ProtocolHandler::parse_control(&value) {
                match control {
                    Ok(message) => {
                        Self::handle_control(&session_id, &protocol, &writer, &events, message);
                    }
                    Err(e) => log::warn!("[{session_id}] {e}"),
                }
                continue;
            }

            match parse_message(value) {
                Ok(message) => {
                    if let Some(event) = normalize(message)
                        && events.send(Ok(event)).is_err()
                    {
                        break;
                    }
                }
                Err(e) => log::debug!("[{session_id}] Skipping unrecognised CLI output: {e}"),
            }
        }
        protocol.fail_pending("Claude CLI output ended");
    }

    fn handle_control(
        session_id: &SessionId,
        protocol: &ProtocolHandler,
        writer: &mpsc::UnboundedSender<WriterCommand>,
        events: &EventSender,
        message: ControlMessage,
    ) {
        match message {
            ControlMessage::ControlResponse { response } => {
                protocol.handle_response(response);
            }
            ControlMessage::ControlRequest {
                request_id,
                request:
                    ControlRequest::HookCallback {
                        callback_id,
                        input,
                        tool_use_id,
                    },
            } => {
                log::debug!("[{session_id}] Hook {callback_id} fired for {tool_use_id:?}");
                Self::forward_tool_call(request_id, &input, tool_use_id, writer, events);
            }
            ControlMessage::ControlRequest { request_id, request } => {
                log::warn!("[{session_id}] Refusing unsupported control request {request:?}");
                send_line(
                    writer,
                    ProtocolHandler::error_reply(&request_id, "Unsupported control request"),
                );
            }
            ControlMessage::ControlCancelRequest { request_id } => {
                log::debug!("[{session_id}] CLI cancelled control request {request_id:?}");
            }
        }
    }

    /// Hand a hooked tool call to the engine and reply once it decides
    fn forward_tool_call(
        request_id: RequestId,
        input: &Value,
        tool_use_id: Option<String>,
        writer: &mpsc::UnboundedSender<WriterCommand>,
        events: &EventSender,
    ) {
        let tool_input = input.get("tool_input").cloned().unwrap_or(Value::Null);
        let (responder, verdict) = oneshot::channel();
        let call = PendingToolCall {
            tool_use_id,
            tool_name: input
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input: tool_input.clone(),
            responder,
        };
        // A closed engine drops the call, which resolves the verdict as Allow
        let _ = events.send(Ok(AgentEvent::ToolRequest(call)));

        let writer = writer.clone();
        tokio::spawn(async move {
            let verdict = verdict.await.unwrap_or(ToolVerdict::Allow);
            let output = hook_output_for(&verdict, &tool_input);
            send_line(&writer, ProtocolHandler::hook_reply(&request_id, &output));
        });
    }

    /// Feed queued prompts to the CLI until the queue completes or the
    /// session is aborted
    pub(super) async fn prompt_task(
        session_id: SessionId,
        prompts: InboundMessages,
        writer: mpsc::UnboundedSender<WriterCommand>,
        abort: CancellationToken,
    ) {
        let prompts = prompts.into_stream();
        tokio::pin!(prompts);

        loop {
            let prompt = tokio::select! {
                biased;
                () = abort.cancelled() => return,
                next = prompts.next() => next,
            };
            let Some(prompt) = prompt else { break };

            let envelope = json!({
                "type": "user",
                "message": {"role": "user", "content": prompt},
                "parent_tool_use_id": null,
            });
            log::debug!("[{session_id}] Sending prompt ({} chars)", prompt.len());
            if writer
                .send(WriterCommand::Line(format!("{envelope}\n")))
                .is_err()
            {
                return;
            }
        }

        log::debug!("[{session_id}] Prompt queue complete; closing CLI input");
        let _ = writer.send(WriterCommand::EndInput);
    }
}

fn send_line(writer: &mpsc::UnboundedSender<WriterCommand>, line: Result<String>) {
    match line {
        Ok(line) => {
            let _ = writer.send(WriterCommand::Line(line));
        }
        Err(e) => log::error!("Failed to serialize control reply: {e}"),
    }
}
