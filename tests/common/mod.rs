//! Shared fixtures for the integration tests
//!
//! [`ScriptedLauncher`] stands in for the Claude CLI. Every launch records what
//! it was asked for, then answers each prompt it pulls from the session queue
//! with the steps returned by the script.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use kodegen_claude_relay::agent::{
    AgentEvent, AgentInvocation, AgentLauncher, CompactTrigger, InvocationControl, LaunchRequest,
    PendingToolCall, StreamDelta, ToolVerdict, TurnResult,
};
use kodegen_claude_relay::config::{BackgroundSettings, RetrySettings};
use kodegen_claude_relay::types::{PermissionMode, SessionId};
use kodegen_claude_relay::{
    ChannelConnection, ClaudeError, Connection, InMemorySessionStore, Orchestrator, RelayConfig,
    Result,
};

/// How long a test waits for a frame before failing
pub const FRAME_WAIT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Scripted agent
// ============================================================================

/// One thing the fake agent does in answer to a prompt
pub enum Step {
    /// Emit an event
    Event(AgentEvent),
    /// Ask for a tool verdict; the receiver is kept on the launch record
    Tool { name: String, input: Value },
    /// Fail the invocation with this error and stop
    Fail(ClaudeError),
    /// Produce nothing more until aborted
    Stall,
}

pub fn init(resume_token: &str) -> Step {
    Step::Event(AgentEvent::Init {
        resume_token: Some(resume_token.to_string()),
        model: Some("claude-sonnet".to_string()),
    })
}

pub fn text(chunk: &str) -> Step {
    Step::Event(AgentEvent::Delta(StreamDelta::Text(chunk.to_string())))
}

pub fn compact(trigger: CompactTrigger, pre_tokens: Option<u64>) -> Step {
    Step::Event(AgentEvent::CompactBoundary { trigger, pre_tokens })
}

pub fn done() -> Step {
    Step::Event(AgentEvent::Result(TurnResult {
        subtype: "success".to_string(),
        ..TurnResult::default()
    }))
}

pub fn failed_turn(message: &str) -> Step {
    Step::Event(AgentEvent::Result(TurnResult {
        is_error: true,
        subtype: "error_during_execution".to_string(),
        result: Some(message.to_string()),
        ..TurnResult::default()
    }))
}

pub fn tool(name: &str, input: Value) -> Step {
    Step::Tool {
        name: name.to_string(),
        input,
    }
}

/// Script: launch number (1-based) and prompt in, steps out
pub type Script = Arc<dyn Fn(usize, &str) -> Vec<Step> + Send + Sync>;

/// Everything one launch was asked for and did
pub struct LaunchRecord {
    pub working_directory: PathBuf,
    pub model: Option<String>,
    pub resume_token: Option<String>,
    pub permission_mode: PermissionMode,
    pub prompts: Arc<Mutex<Vec<String>>>,
    pub verdicts: Arc<Mutex<Vec<(String, oneshot::Receiver<ToolVerdict>)>>>,
    pub control: Arc<RecordingControl>,
}

#[derive(Default)]
pub struct RecordingControl {
    pub modes: Mutex<Vec<PermissionMode>>,
    pub interrupts: Mutex<u32>,
}

impl InvocationControl for RecordingControl {
    fn set_permission_mode(&self, mode: PermissionMode) -> BoxFuture<'_, Result<()>> {
        self.modes.lock().push(mode);
        Box::pin(async { Ok(()) })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<()>> {
        *self.interrupts.lock() += 1;
        Box::pin(async { Ok(()) })
    }
}

pub struct ScriptedLauncher {
    script: Script,
    launch_failures: Mutex<VecDeque<ClaudeError>>,
    pub launches: Mutex<Vec<Arc<LaunchRecord>>>,
}

impl ScriptedLauncher {
    pub fn new(script: impl Fn(usize, &str) -> Vec<Step> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
            launch_failures: Mutex::new(VecDeque::new()),
            launches: Mutex::new(Vec::new()),
        })
    }

    /// Agent that streams `Echo: <prompt>` and finishes every turn
    pub fn echo() -> Arc<Self> {
        Self::new(|_, prompt| vec![text(&format!("Echo: {prompt}")), done()])
    }

    /// Make the next launch fail before any event is produced
    pub fn fail_next_launch(&self, error: ClaudeError) {
        self.launch_failures.lock().push_back(error);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn launch(&self, index: usize) -> Arc<LaunchRecord> {
        Arc::clone(&self.launches.lock()[index])
    }
}

struct ScriptedInvocation {
    events: mpsc::UnboundedReceiver<Result<AgentEvent>>,
    control: Arc<RecordingControl>,
}

impl AgentInvocation for ScriptedInvocation {
    fn next_event(&mut self) -> BoxFuture<'_, Option<Result<AgentEvent>>> {
        Box::pin(self.events.recv())
    }

    fn control(&self) -> Arc<dyn InvocationControl> {
        Arc::clone(&self.control) as Arc<dyn InvocationControl>
    }
}

impl AgentLauncher for ScriptedLauncher {
    fn launch(&self, request: LaunchRequest) -> BoxFuture<'_, Result<Box<dyn AgentInvocation>>> {
        Box::pin(async move {
            let record = Arc::new(LaunchRecord {
                working_directory: request.working_directory.clone(),
                model: request.model.clone(),
                resume_token: request.resume_token.clone(),
                permission_mode: request.permission_mode,
                prompts: Arc::default(),
                verdicts: Arc::default(),
                control: Arc::default(),
            });
            let number = {
                let mut launches = self.launches.lock();
                launches.push(Arc::clone(&record));
                launches.len()
            };

            if let Some(error) = self.launch_failures.lock().pop_front() {
                return Err(error);
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let script = Arc::clone(&self.script);
            let control = Arc::clone(&record.control);
            tokio::spawn(serve(number, request, record, script, tx));

            Ok(Box::new(ScriptedInvocation { events: rx, control }) as Box<dyn AgentInvocation>)
        })
    }
}

async fn serve(
    number: usize,
    request: LaunchRequest,
    record: Arc<LaunchRecord>,
    script: Script,
    tx: mpsc::UnboundedSender<Result<AgentEvent>>,
) {
    loop {
        let prompt = tokio::select! {
            () = request.abort.cancelled() => return,
            prompt = request.prompts.next() => match prompt {
                Some(prompt) => prompt,
                None => return,
            },
        };
        record.prompts.lock().push(prompt.clone());

        for step in script(number, &prompt) {
            match step {
                Step::Event(event) => {
                    if tx.send(Ok(event)).is_err() {
                        return;
                    }
                }
                Step::Tool { name, input } => {
                    let (responder, verdict) = oneshot::channel();
                    record.verdicts.lock().push((name.clone(), verdict));
                    let call = PendingToolCall {
                        tool_use_id: Some(format!("toolu_{number}")),
                        tool_name: name,
                        input,
                        responder,
                    };
                    if tx.send(Ok(AgentEvent::ToolRequest(call))).is_err() {
                        return;
                    }
                }
                Step::Fail(error) => {
                    let _ = tx.send(Err(error));
                    return;
                }
                Step::Stall => {
                    request.abort.cancelled().await;
                    return;
                }
            }
        }
    }
}

// ============================================================================
// Client side
// ============================================================================

/// A client connection whose frames are parsed back into JSON
pub struct TestClient {
    pub connection: Arc<dyn Connection>,
    frames: mpsc::UnboundedReceiver<String>,
}

impl TestClient {
    pub fn new() -> Self {
        let (connection, frames) = ChannelConnection::new();
        Self {
            connection: connection as Arc<dyn Connection>,
            frames,
        }
    }

    /// Next frame, failing the test if none arrives in time
    pub async fn next(&mut self) -> Value {
        let frame = tokio::time::timeout(FRAME_WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed");
        serde_json::from_str(&frame).expect("frame is JSON")
    }

    /// Frames up to and including the first one of type `kind`, keepalives skipped
    pub async fn until(&mut self, kind: &str) -> Vec<Value> {
        let mut seen = Vec::new();
        loop {
            let frame = self.next().await;
            if frame["type"] == "keepalive" {
                continue;
            }
            let last = frame["type"] == kind;
            seen.push(frame);
            if last {
                return seen;
            }
        }
    }

    /// Frames already delivered, without waiting
    pub fn drain(&mut self) -> Vec<Value> {
        let mut seen = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            seen.push(serde_json::from_str(&frame).expect("frame is JSON"));
        }
        seen
    }
}

pub fn types(frames: &[Value]) -> Vec<&str> {
    frames.iter().filter_map(|f| f["type"].as_str()).collect()
}

pub fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["type"] == kind).collect()
}

// ============================================================================
// Relay
// ============================================================================

pub struct Relay {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<InMemorySessionStore>,
    pub launcher: Arc<ScriptedLauncher>,
    pub workdir: tempfile::TempDir,
}

impl Relay {
    pub fn session(&self, id: &str) -> SessionId {
        let session_id = SessionId::new(id);
        self.store.ensure_session(&session_id, self.workdir.path());
        session_id
    }
}

pub fn test_config(log_dir: &std::path::Path) -> RelayConfig {
    RelayConfig::builder()
        .retry(RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 50,
        })
        .background(BackgroundSettings {
            log_dir: log_dir.to_path_buf(),
            poll_interval_ms: 50,
            kill_grace_ms: 200,
            exit_drain_delay_ms: 50,
            ..BackgroundSettings::default()
        })
        .build()
}

pub fn relay(launcher: Arc<ScriptedLauncher>) -> Relay {
    relay_with(launcher, test_config)
}

pub fn relay_with(
    launcher: Arc<ScriptedLauncher>,
    config: impl FnOnce(&std::path::Path) -> RelayConfig,
) -> Relay {
    init_logging();
    let workdir = tempfile::tempdir().expect("tempdir");
    let config = config(&workdir.path().join("logs"));
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = Orchestrator::new(
        config,
        Arc::clone(&store) as Arc<dyn kodegen_claude_relay::SessionStore>,
        Arc::clone(&launcher) as Arc<dyn AgentLauncher>,
    )
    .expect("valid config");
    Relay {
        orchestrator,
        store,
        launcher,
        workdir,
    }
}
