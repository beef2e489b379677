//! Turn protocol engine
//!
//! One [`TurnProtocolEngine::run`] call owns a session stream for its whole
//! life: it launches an agent invocation, drains its events, translates them
//! into [`ProtocolEvent`]s, persists turn content, and retries failed
//! launches. The same invocation serves every turn until the stream is
//! cleaned up, aborted, or fails for good.

mod state;
mod tools;
mod usage;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentEvent, AgentLauncher, CompactTrigger, LaunchRequest, StreamDelta, TurnResult};
use crate::background::BackgroundProcessManager;
use crate::config::RelayConfig;
use crate::error::{ClaudeError, Result};
use crate::manager::{CleanupReason, SessionStreamManager, StreamHandle};
use crate::persistence::SessionStore;
use crate::retry::{ErrorClassification, RetryController, RetryError, classify_error};
use crate::timeout::TimeoutController;
use crate::types::events::ProtocolEvent;
use crate::types::identifiers::SessionId;
use crate::types::messages::ContentBlock;
use crate::types::permissions::PermissionMode;
use crate::types::session::{MessageRole, StoredMessage};

pub use state::{TurnDiagnostics, TurnState};
pub use usage::extract_context_usage;

/// Name of the tool the agent calls to leave plan mode
pub const EXIT_PLAN_TOOL: &str = "ExitPlanMode";

/// How a drain loop ended
#[derive(Debug)]
pub enum DrainOutcome {
    /// The stream was closed and the invocation finished cleanly
    Completed,
    /// The user stopped generation
    Aborted,
    /// Retries exhausted or a non-retryable failure
    Failed(ErrorClassification),
}

/// Drives agent invocations for session streams
pub struct TurnProtocolEngine {
    streams: Arc<SessionStreamManager>,
    background: Arc<BackgroundProcessManager>,
    store: Arc<dyn SessionStore>,
    launcher: Arc<dyn AgentLauncher>,
    config: Arc<RelayConfig>,
    retry: RetryController,
}

/// State that outlives the attempts of one drain loop
#[derive(Debug, Default)]
struct DrainShared {
    /// Prompt whose turn has not completed yet
    in_flight: Mutex<Option<String>>,
    /// Set when an attempt completes a turn; cleared when a failure is judged
    completed_turn: AtomicBool,
}

/// Per-attempt shared state
struct TurnContext {
    session_id: SessionId,
    working_directory: std::path::PathBuf,
    model: Option<String>,
    resume_token: Option<String>,
    timeout: Arc<TimeoutController>,
    diagnostics: Arc<TurnDiagnostics>,
    /// Cancelled when the attempt ends, for any reason
    abort: CancellationToken,
    shared: Arc<DrainShared>,
    turn_active: Arc<AtomicBool>,
    prompt_chars: Arc<AtomicUsize>,
}

impl TurnProtocolEngine {
    /// Create an engine over the shared components
    #[must_use]
    pub fn new(
        streams: Arc<SessionStreamManager>,
        background: Arc<BackgroundProcessManager>,
        store: Arc<dyn SessionStore>,
        launcher: Arc<dyn AgentLauncher>,
        config: Arc<RelayConfig>,
    ) -> Self {
        let retry = RetryController::new(config.retry_policy());
        Self {
            streams,
            background,
            store,
            launcher,
            config,
            retry,
        }
    }

    /// Serve `handle` until its stream ends, then clean up the generation it owns
    pub async fn run(&self, handle: StreamHandle, model: Option<String>) -> DrainOutcome {
        let session_id = handle.session_id.clone();
        let shared = Arc::new(DrainShared::default());

        let result = self
            .retry
            .run_with_progress(
                |attempt| self.attempt(&handle, model.as_deref(), attempt, Arc::clone(&shared)),
                || shared.completed_turn.swap(false, Ordering::SeqCst),
                |notice| {
                    if let Some(prompt) = shared.in_flight.lock().take() {
                        handle.messages.queue().push_front(prompt);
                    }
                    self.streams.safe_send(&session_id, &ProtocolEvent::RetryAttempt {
                        attempt: notice.attempt,
                        max_attempts: notice.max_attempts,
                        delay_ms: u64::try_from(notice.delay.as_millis()).unwrap_or(u64::MAX),
                        error_type: notice.classification.kind.as_str().to_string(),
                    });
                },
                &handle.cancel,
            )
            .await;

        match result {
            Ok(()) => {
                self.streams
                    .cleanup_generation(&session_id, handle.generation, CleanupReason::Completed);
                DrainOutcome::Completed
            }
            Err(RetryError::Aborted(reason)) => {
                log::info!("[{session_id}] turn aborted: {reason}");
                self.streams
                    .cleanup_generation(&session_id, handle.generation, CleanupReason::Aborted);
                DrainOutcome::Aborted
            }
            Err(RetryError::Failed {
                classification,
                attempts,
                source,
            }) => {
                log::error!(
                    "[{session_id}] giving up after {attempts} attempt(s) ({}): {source}",
                    classification.kind
                );
                self.streams.safe_send(&session_id, &ProtocolEvent::Error {
                    message: classification.message.clone(),
                    error_type: Some(classification.kind.as_str().to_string()),
                    request_id: classification.request_id.clone(),
                });
                self.streams
                    .cleanup_generation(&session_id, handle.generation, CleanupReason::Error);
                DrainOutcome::Failed(classification)
            }
        }
    }

    async fn attempt(
        &self,
        handle: &StreamHandle,
        model: Option<&str>,
        attempt: u32,
        shared: Arc<DrainShared>,
    ) -> Result<()> {
        let session_id = &handle.session_id;
        let session = self.store.get_session(session_id).await?;
        log::info!(
            "[{session_id}] spawning agent (attempt {attempt}, resume: {})",
            session.resume_token.is_some()
        );

        let diagnostics = Arc::new(TurnDiagnostics::default());
        let timeout = {
            let streams = Arc::clone(&self.streams);
            let sid = session_id.clone();
            let diagnostics = Arc::clone(&diagnostics);
            Arc::new(TimeoutController::new(
                self.config.warning_after(),
                self.config.hard_timeout(),
                move |elapsed| {
                    log::warn!(
                        "[{sid}] no progress for {}s ({} tool call(s) this turn, last event: {})",
                        elapsed.as_secs(),
                        diagnostics.tool_invocations(),
                        diagnostics.last_event()
                    );
                    streams.safe_send(&sid, &ProtocolEvent::TimeoutWarning {
                        elapsed_seconds: elapsed.as_secs(),
                    });
                },
            ))
        };

        let abort = handle.cancel.child_token();
        let _abort_on_exit = abort.clone().drop_guard();

        let ctx = TurnContext {
            session_id: session_id.clone(),
            working_directory: session.working_directory.clone(),
            model: model
                .map(str::to_string)
                .or_else(|| self.config.agent.model.clone()),
            resume_token: session.resume_token.clone(),
            timeout: Arc::clone(&timeout),
            diagnostics,
            abort: abort.clone(),
            shared,
            turn_active: Arc::new(AtomicBool::new(false)),
            prompt_chars: Arc::new(AtomicUsize::new(0)),
        };

        let prompts = {
            let shared = Arc::clone(&ctx.shared);
            let turn_active = Arc::clone(&ctx.turn_active);
            let prompt_chars = Arc::clone(&ctx.prompt_chars);
            let timeout: Weak<TimeoutController> = Arc::downgrade(&timeout);
            let streams = Arc::clone(&self.streams);
            let sid = session_id.clone();
            handle.messages.clone().with_observer(move |prompt| {
                *shared.in_flight.lock() = Some(prompt.to_string());
                turn_active.store(true, Ordering::SeqCst);
                prompt_chars.fetch_add(prompt.chars().count(), Ordering::Relaxed);
                if let Some(timeout) = timeout.upgrade() {
                    timeout.reset();
                }
                streams.touch(&sid);
            })
        };

        let request = LaunchRequest {
            session_id: session_id.clone(),
            working_directory: session.working_directory.clone(),
            model: ctx.model.clone(),
            system_prompt: self.config.agent.system_prompt.clone(),
            resume_token: session.resume_token.clone(),
            permission_mode: PermissionMode::BypassPermissions,
            abort: abort.clone(),
            prompts,
        };

        let mut invocation = tokio::select! {
            biased;
            () = handle.cancel.cancelled() => {
                return Err(ClaudeError::aborted("stopped before the agent started"));
            }
            launched = self.launcher.launch(request) => launched?,
        };

        let control = invocation.control();
        if session.permission_mode == PermissionMode::Plan {
            if let Err(e) = control.set_permission_mode(PermissionMode::Plan).await {
                log::warn!("[{session_id}] could not switch to plan mode, staying in bypassPermissions: {e}");
            }
        }
        self.streams
            .register_invocation(session_id, handle.generation, Arc::clone(&control));

        let mut state = TurnState::default();
        let mut ctx = ctx;
        let expired = timeout.expired();
        let keepalive_period = self.config.keepalive_interval().max(Duration::from_millis(1));
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + keepalive_period, keepalive_period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = Instant::now();

        loop {
            tokio::select! {
                biased;
                () = handle.cancel.cancelled() => {
                    self.finish_aborted(&ctx, &mut state).await;
                    return Err(ClaudeError::aborted("generation stopped"));
                }
                () = expired.cancelled() => {
                    self.flush(&ctx, &mut state).await;
                    timeout.check_timeout()?;
                    return Err(ClaudeError::timeout("turn watchdog expired"));
                }
                _ = keepalive.tick() => {
                    self.streams.safe_send(session_id, &ProtocolEvent::Keepalive {
                        elapsed_seconds: started.elapsed().as_secs(),
                    });
                }
                event = invocation.next_event() => match event {
                    Some(Ok(event)) => self.handle_event(&mut ctx, &mut state, event).await,
                    Some(Err(e)) => {
                        self.flush(&ctx, &mut state).await;
                        return Err(e);
                    }
                    None => {
                        self.flush(&ctx, &mut state).await;
                        if handle.messages.queue().is_complete() {
                            log::debug!("[{session_id}] agent finished after stream closed");
                            return Ok(());
                        }
                        return Err(ClaudeError::process(
                            "agent invocation ended while the session was still open",
                            -1,
                            None,
                        ));
                    }
                },
            }
        }
    }

    async fn handle_event(&self, ctx: &mut TurnContext, state: &mut TurnState, event: AgentEvent) {
        let session_id = ctx.session_id.clone();
        match event {
            AgentEvent::Init {
                resume_token,
                model,
            } => {
                ctx.diagnostics.observe("init");
                if let Some(model) = model {
                    ctx.model = Some(model);
                }
                if let Some(token) = resume_token
                    && ctx.resume_token.as_deref() != Some(token.as_str())
                {
                    log::debug!("[{session_id}] new resume token {token}");
                    warn_on_err(
                        &session_id,
                        "resume token",
                        self.store
                            .update_resume_token(&session_id, Some(token.clone()))
                            .await,
                    );
                    ctx.resume_token = Some(token);
                }
            }
            AgentEvent::CompactBoundary { trigger, pre_tokens } => {
                ctx.diagnostics.observe("compact_boundary");
                self.flush(ctx, state).await;
                let tokens = pre_tokens.map(|t| format!(" ({t} tokens before)")).unwrap_or_default();
                let (divider, event) = match trigger {
                    CompactTrigger::Auto => (
                        format!("Conversation compacted automatically{tokens}"),
                        ProtocolEvent::CompactStart,
                    ),
                    CompactTrigger::Manual => (
                        format!("Conversation compacted{tokens}"),
                        ProtocolEvent::CompactComplete,
                    ),
                };
                warn_on_err(
                    &session_id,
                    "compaction divider",
                    self.store
                        .add_message(&session_id, StoredMessage::text(MessageRole::System, divider))
                        .await
                        .map(|_| ()),
                );
                self.streams.safe_send(&session_id, &event);
            }
            AgentEvent::Delta(delta) => self.handle_delta(ctx, state, delta).await,
            AgentEvent::Assistant { blocks, model } => {
                ctx.diagnostics.observe("assistant");
                if ctx.model.is_none() {
                    ctx.model = model;
                }
                for block in blocks {
                    self.handle_block(ctx, state, block);
                }
                self.flush(ctx, state).await;
            }
            AgentEvent::ToolRequest(call) => {
                ctx.diagnostics.observe("tool_request");
                self.intercept(ctx, call);
            }
            AgentEvent::Result(result) => {
                ctx.diagnostics.observe("result");
                self.finish_turn(ctx, state, &result).await;
            }
        }
    }

    async fn handle_delta(&self, ctx: &TurnContext, state: &mut TurnState, delta: StreamDelta) {
        let session_id = &ctx.session_id;
        match delta {
            StreamDelta::Text(text) => {
                ctx.diagnostics.observe("text_delta");
                ctx.timeout.reset();
                self.streams.touch(session_id);
                state.streamed_text = true;
                state.push_text(&text);
                self.streams
                    .safe_send(session_id, &ProtocolEvent::AssistantMessage { content: text });
                if state.unsaved_chars >= self.config.flush_threshold_chars {
                    self.flush(ctx, state).await;
                }
            }
            StreamDelta::ThinkingStart => {
                ctx.diagnostics.observe("thinking_start");
                self.streams.safe_send(session_id, &ProtocolEvent::ThinkingStart);
            }
            StreamDelta::Thinking(content) => {
                ctx.diagnostics.observe("thinking_delta");
                self.streams
                    .safe_send(session_id, &ProtocolEvent::ThinkingDelta { content });
            }
            StreamDelta::ToolInput(_) => ctx.diagnostics.observe("tool_input_delta"),
            StreamDelta::Signature => ctx.diagnostics.observe("signature_delta"),
        }
    }

    fn handle_block(&self, ctx: &TurnContext, state: &mut TurnState, block: ContentBlock) {
        let session_id = &ctx.session_id;
        match block {
            ContentBlock::Text { text } => {
                if !state.streamed_text && !text.is_empty() {
                    ctx.timeout.reset();
                    state.push_text(&text);
                    self.streams
                        .safe_send(session_id, &ProtocolEvent::AssistantMessage { content: text });
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                ctx.timeout.reset();
                let count = ctx.diagnostics.count_tool();
                log::debug!("[{session_id}] tool call #{count}: {name}");
                if name == EXIT_PLAN_TOOL {
                    if !state.plan_exit_notified {
                        state.plan_exit_notified = true;
                        let plan = input
                            .get("plan")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        self.streams
                            .safe_send(session_id, &ProtocolEvent::ExitPlanMode { plan });
                    }
                } else {
                    self.streams.safe_send(session_id, &ProtocolEvent::ToolUse {
                        tool_id: id.clone(),
                        tool_name: name.clone(),
                        tool_input: input.clone(),
                    });
                }
                state.push_block(ContentBlock::ToolUse { id, name, input });
            }
            ContentBlock::Unsupported => {}
            other => state.push_block(other),
        }
    }

    async fn finish_turn(&self, ctx: &TurnContext, state: &mut TurnState, result: &TurnResult) {
        let session_id = &ctx.session_id;
        ctx.timeout.reset();
        ctx.timeout.cancel();
        self.flush(ctx, state).await;

        let usage = extract_context_usage(
            result,
            ctx.model.as_deref(),
            self.config.default_context_window,
            ctx.prompt_chars.swap(0, Ordering::Relaxed),
            state.text.chars().count(),
        );
        warn_on_err(
            session_id,
            "context usage",
            self.store.update_context_usage(session_id, usage.clone()).await,
        );
        self.streams.safe_send(session_id, &ProtocolEvent::ContextUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            context_window: usage.context_window,
            context_percentage: usage.context_percentage,
        });
        self.streams.safe_send(session_id, &ProtocolEvent::Result {
            success: !result.is_error,
        });

        if result.is_error {
            let message = result
                .result
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| format!("agent turn ended with {}", result.subtype));
            let classification = classify_error(&ClaudeError::agent(message, None));
            log::warn!("[{session_id}] agent reported an error ({}): {}", classification.kind, classification.message);
            self.streams.safe_send(session_id, &ProtocolEvent::Error {
                message: classification.message,
                error_type: Some(classification.kind.as_str().to_string()),
                request_id: classification.request_id,
            });
        }

        state.reset(&ctx.diagnostics);
        ctx.shared.in_flight.lock().take();
        ctx.shared.completed_turn.store(true, Ordering::SeqCst);
        ctx.turn_active.store(false, Ordering::SeqCst);
        self.streams.touch(session_id);
    }

    /// Persist partial content and close out the turn for the client
    async fn finish_aborted(&self, ctx: &TurnContext, state: &mut TurnState) {
        ctx.timeout.cancel();
        self.flush(ctx, state).await;
        if ctx.turn_active.swap(false, Ordering::SeqCst) || state.has_content() {
            self.streams
                .safe_send(&ctx.session_id, &ProtocolEvent::Result { success: true });
        }
        ctx.shared.in_flight.lock().take();
        state.reset(&ctx.diagnostics);
    }

    /// Write accumulated content, creating the message on first flush
    async fn flush(&self, ctx: &TurnContext, state: &mut TurnState) {
        if !state.dirty || !state.has_content() {
            return;
        }
        let session_id = &ctx.session_id;
        let content = state.text.clone();
        let blocks = state.persisted_blocks();
        let saved = match state.message_id.clone() {
            Some(message_id) => self
                .store
                .update_message(session_id, &message_id, content, blocks)
                .await
                .map(|()| message_id),
            None => {
                let mut message = StoredMessage::text(MessageRole::Assistant, content);
                message.blocks = blocks;
                self.store.add_message(session_id, message).await
            }
        };
        match saved {
            Ok(message_id) => state.mark_saved(message_id),
            Err(e) => log::warn!("[{session_id}] failed to persist turn content: {e}"),
        }
    }
}

fn warn_on_err(session_id: &SessionId, what: &str, result: Result<()>) {
    if let Err(e) = result {
        log::warn!("[{session_id}] failed to persist {what}: {e}");
    }
}
