//! `ClaudeCliInvocation` startup

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::agent::LaunchRequest;
use crate::config::AgentSettings;
use crate::control::ProtocolHandler;
use crate::error::Result;
use crate::transport::{SubprocessOptions, SubprocessTransport, Transport};

use super::{CliControl, ClaudeCliInvocation};

impl ClaudeCliInvocation {
    /// Spawn the CLI for `request` and complete the `initialize` handshake
    ///
    /// # Errors
    /// Returns error if the CLI cannot be found or started, or if it exits
    /// or stays silent instead of answering `initialize`
    pub(super) async fn start(settings: &AgentSettings, request: LaunchRequest) -> Result<Self> {
        let LaunchRequest {
            session_id,
            working_directory,
            model,
            system_prompt,
            resume_token,
            permission_mode,
            abort,
            prompts,
        } = request;

        let mut options = SubprocessOptions::new(working_directory);
        options.cli_path = settings.cli_path.clone();
        options.model = model.or_else(|| settings.model.clone());
        options.system_prompt = system_prompt.or_else(|| settings.system_prompt.clone());
        options.resume = resume_token;
        options.permission_mode = permission_mode;
        options.env = settings.extra_env.clone();

        log::info!(
            "[{session_id}] Starting Claude CLI in {} (resume: {})",
            options.cwd.display(),
            options.resume.as_deref().unwrap_or("none")
        );

        let mut transport = SubprocessTransport::new(options)?;
        transport.connect().await?;
        let messages = transport.read_messages();
        let transport = Arc::new(Mutex::new(transport));

        let protocol = Arc::new(ProtocolHandler::new());
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(Self::writer_task(
                session_id.clone(),
                Arc::clone(&transport),
                writer_rx,
            )),
            tokio::spawn(Self::reader_task(
                session_id.clone(),
                messages,
                Arc::clone(&protocol),
                writer_tx.clone(),
                event_tx,
            )),
        ];

        let mut invocation = Self {
            session_id: session_id.clone(),
            transport,
            events: event_rx,
            control: Arc::new(CliControl {
                protocol: Arc::clone(&protocol),
                writer: writer_tx.clone(),
            }),
            tasks,
        };

        let initialize = protocol.create_initialize_request()?;
        if let Err(e) = invocation.control.call(initialize).await {
            // A CLI that died during startup has already reported why
            while let Ok(item) = invocation.events.try_recv() {
                if let Err(exit) = item {
                    return Err(exit);
                }
            }
            return Err(e);
        }
        log::debug!("[{session_id}] Claude CLI initialized");

        invocation
            .tasks
            .push(tokio::spawn(Self::prompt_task(session_id, prompts, writer_tx, abort)));
        Ok(invocation)
    }
}
