//! Process-wide owner of every relay component
//!
//! An [`Orchestrator`] is built once at start-up and handed to whatever reads
//! client messages. It decides whether a chat message joins a live stream or
//! starts a fresh drain loop, and implements the session lifecycle operations
//! that force a respawn.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::agent::AgentLauncher;
use crate::background::BackgroundProcessManager;
use crate::config::RelayConfig;
use crate::engine::{DrainOutcome, TurnProtocolEngine};
use crate::error::{ClaudeError, Result};
use crate::manager::{CleanupReason, Connection, SessionStreamManager};
use crate::persistence::SessionStore;
use crate::types::events::{ClientMessage, ProtocolEvent};
use crate::types::identifiers::{BashId, SessionId};
use crate::types::permissions::PermissionMode;
use crate::types::session::StoredMessage;

/// Chat content that asks the agent to compact its history
pub const COMPACT_COMMAND: &str = "/compact";

/// Prompt enqueued after the user approves a plan
pub const PLAN_APPROVED_PROMPT: &str =
    "The plan has been approved. Proceed with implementing it.";

/// How long a new chat waits for the previous drain loop of the same session
const PREVIOUS_DRAIN_WAIT: Duration = Duration::from_secs(5);

/// Upper bound on waiting for the agent to acknowledge an interrupt
const INTERRUPT_WAIT: Duration = Duration::from_secs(2);

struct DrainTask {
    generation: u64,
    handle: JoinHandle<DrainOutcome>,
}

/// Owns the stream registry, background processes, and the turn engine
pub struct Orchestrator {
    config: Arc<RelayConfig>,
    streams: Arc<SessionStreamManager>,
    background: Arc<BackgroundProcessManager>,
    store: Arc<dyn SessionStore>,
    engine: Arc<TurnProtocolEngine>,
    session_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    /// Running drain loops; each removes its own entry when it ends
    drains: Arc<Mutex<HashMap<SessionId, DrainTask>>>,
}

impl Orchestrator {
    /// Validate `config`, wire up every component and start the idle reaper
    ///
    /// # Errors
    /// Returns `ClaudeError::InvalidConfig` if the configuration is rejected
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn SessionStore>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let streams = Arc::new(SessionStreamManager::new(config.streams.clone()));
        let background = Arc::new(BackgroundProcessManager::new(config.background.clone()));
        let engine = Arc::new(TurnProtocolEngine::new(
            Arc::clone(&streams),
            Arc::clone(&background),
            Arc::clone(&store),
            launcher,
            Arc::clone(&config),
        ));

        // Sessions that vanish without an explicit request take their
        // background processes with them.
        let reaped_background = Arc::clone(&background);
        streams.on_cleanup(move |session_id, reason| {
            if matches!(reason, CleanupReason::IdleTimeout | CleanupReason::Evicted) {
                let background = Arc::clone(&reaped_background);
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    background.cleanup_session(&session_id).await;
                });
            }
        });
        streams.start_reaper();

        log::info!(
            "Relay ready (max {} sessions, idle window {}s)",
            config.streams.max_sessions,
            config.streams.idle_timeout_secs
        );

        Ok(Arc::new(Self {
            config,
            streams,
            background,
            store,
            engine,
            session_locks: Mutex::new(HashMap::new()),
            drains: Arc::default(),
        }))
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Stream registry
    #[must_use]
    pub const fn streams(&self) -> &Arc<SessionStreamManager> {
        &self.streams
    }

    /// Background process registry
    #[must_use]
    pub const fn background(&self) -> &Arc<BackgroundProcessManager> {
        &self.background
    }

    /// Persistence collaborator
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Dispatch one inbound client message arriving on `connection`
    ///
    /// # Errors
    /// Returns the error of the operation the message maps to
    pub async fn handle(&self, message: ClientMessage, connection: &Arc<dyn Connection>) -> Result<()> {
        match message {
            ClientMessage::Chat {
                content,
                session_id,
                model,
            } => self.chat(&session_id, content, model, connection).await,
            ClientMessage::StopGeneration { session_id } => {
                self.stop_generation(&session_id, connection);
                Ok(())
            }
            ClientMessage::SetPermissionMode { session_id, mode } => {
                self.set_permission_mode(&session_id, mode, connection).await
            }
            ClientMessage::ApprovePlan { session_id } => self.approve_plan(&session_id, connection).await,
            ClientMessage::KillBackgroundProcess { bash_id } => {
                self.kill_background_process(&bash_id, connection).await
            }
        }
    }

    /// Persist a user message and deliver it to the session's agent, spawning
    /// a drain loop when no live stream exists
    ///
    /// # Errors
    /// Returns error if the session does not exist or the message cannot be persisted
    pub async fn chat(
        &self,
        session_id: &SessionId,
        content: String,
        model: Option<String>,
        connection: &Arc<dyn Connection>,
    ) -> Result<()> {
        let result = {
            let lock = self.session_lock(session_id);
            let _guard = lock.lock().await;
            self.chat_locked(session_id, content, model, connection).await
        };
        self.release_session_lock(session_id);
        result
    }

    async fn chat_locked(
        &self,
        session_id: &SessionId,
        content: String,
        model: Option<String>,
        connection: &Arc<dyn Connection>,
    ) -> Result<()> {
        self.store.get_session(session_id).await?;
        self.store
            .add_message(session_id, StoredMessage::user(content.clone()))
            .await?;

        if content.trim() == COMPACT_COMMAND {
            SessionStreamManager::send_to(connection.as_ref(), session_id, &ProtocolEvent::CompactLoading);
        }

        if self.streams.is_live(session_id) {
            self.streams.update_connection(session_id, connection);
            match self.streams.send_message(session_id, content.clone()) {
                Ok(()) => {
                    log::debug!("[{session_id}] queued message on live stream");
                    return Ok(());
                }
                Err(e) => log::debug!("[{session_id}] live stream closed while queueing: {e}"),
            }
        }

        self.await_previous_drain(session_id).await;
        self.streams.cleanup_session(session_id, CleanupReason::Replaced);

        let handle = self.streams.get_or_create_stream(session_id);
        self.streams.update_connection(session_id, connection);
        self.streams.send_message(session_id, content)?;

        let generation = handle.generation;
        let engine = Arc::clone(&self.engine);
        let drains = Arc::clone(&self.drains);
        let owner = session_id.clone();
        {
            // Registered under the map lock so the task cannot finish and
            // deregister before it is inserted.
            let mut running = self.drains.lock();
            let task = tokio::spawn(async move {
                let outcome = engine.run(handle, model).await;
                let mut drains = drains.lock();
                if drains.get(&owner).is_some_and(|task| task.generation == generation) {
                    drains.remove(&owner);
                }
                outcome
            });
            running.insert(session_id.clone(), DrainTask { generation, handle: task });
        }
        log::info!("[{session_id}] started drain loop (generation {generation})");
        Ok(())
    }

    /// Stop the session's current turn; the next chat respawns
    pub fn stop_generation(&self, session_id: &SessionId, connection: &Arc<dyn Connection>) -> bool {
        self.streams.update_connection(session_id, connection);
        let control = self.streams.invocation(session_id);
        let existed = self.streams.abort_session(session_id);
        if !existed {
            log::debug!("[{session_id}] stop requested with no active stream");
        }
        if let Some(control) = control {
            let session_id = session_id.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(INTERRUPT_WAIT, control.interrupt()).await {
                    Ok(Ok(())) => log::debug!("[{session_id}] agent acknowledged interrupt"),
                    Ok(Err(e)) => log::debug!("[{session_id}] interrupt not delivered: {e}"),
                    Err(_) => log::debug!("[{session_id}] interrupt unanswered after {INTERRUPT_WAIT:?}"),
                }
            });
        }
        existed
    }

    /// Switch the session's permission mode, live if an invocation is running
    ///
    /// # Errors
    /// Returns error if the mode cannot be persisted
    pub async fn set_permission_mode(
        &self,
        session_id: &SessionId,
        mode: PermissionMode,
        connection: &Arc<dyn Connection>,
    ) -> Result<()> {
        self.store.update_permission_mode(session_id, mode).await?;
        if let Some(invocation) = self.streams.invocation(session_id)
            && let Err(e) = invocation.set_permission_mode(mode).await
        {
            log::warn!("[{session_id}] live permission mode switch to {mode} failed: {e}");
        }
        log::info!("[{session_id}] permission mode set to {mode}");
        SessionStreamManager::send_to(
            connection.as_ref(),
            session_id,
            &ProtocolEvent::PermissionModeChanged { mode },
        );
        Ok(())
    }

    /// Leave plan mode and tell the agent to carry out the plan
    ///
    /// # Errors
    /// Returns error if the mode switch or the continuation message fails
    pub async fn approve_plan(&self, session_id: &SessionId, connection: &Arc<dyn Connection>) -> Result<()> {
        self.set_permission_mode(session_id, PermissionMode::BypassPermissions, connection)
            .await?;
        self.chat(session_id, PLAN_APPROVED_PROMPT.to_string(), None, connection)
            .await
    }

    /// Kill a background process and report it to the requesting connection
    ///
    /// # Errors
    /// Returns `ClaudeError::BackgroundProcess` if `bash_id` is not tracked
    pub async fn kill_background_process(
        &self,
        bash_id: &BashId,
        connection: &Arc<dyn Connection>,
    ) -> Result<()> {
        let process = self
            .background
            .get(bash_id)
            .ok_or_else(|| ClaudeError::background(format!("unknown background process {bash_id}")))?;
        self.background.kill(bash_id).await;
        SessionStreamManager::send_to(
            connection.as_ref(),
            &process.session_id,
            &ProtocolEvent::BackgroundProcessKilled {
                bash_id: bash_id.clone(),
            },
        );
        Ok(())
    }

    /// Tear down the session's stream and background processes, then delete it
    ///
    /// # Errors
    /// Returns error if the persistence collaborator fails to delete the session
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<()> {
        self.streams.cleanup_session(session_id, CleanupReason::Deleted);
        self.background.cleanup_session(session_id).await;
        self.drains.lock().remove(session_id);
        self.store.delete_session(session_id).await
    }

    /// Move the session to another directory; the next message starts a fresh
    /// conversation there
    ///
    /// # Errors
    /// Returns error if the directory does not exist or persistence fails
    pub async fn change_working_directory(&self, session_id: &SessionId, dir: PathBuf) -> Result<()> {
        if !dir.is_dir() {
            return Err(ClaudeError::invalid_config(format!(
                "working directory does not exist: {}",
                dir.display()
            )));
        }
        self.store.update_working_directory(session_id, dir).await?;
        self.store.update_resume_token(session_id, None).await?;
        self.streams
            .cleanup_session(session_id, CleanupReason::DirectoryChanged);
        Ok(())
    }

    /// Change the conversation mode; the next message respawns the agent
    ///
    /// # Errors
    /// Returns error if persistence fails
    pub async fn change_conversation_mode(&self, session_id: &SessionId, mode: Option<String>) -> Result<()> {
        self.store.update_conversation_mode(session_id, mode).await?;
        self.store.update_resume_token(session_id, None).await?;
        self.streams.cleanup_session(session_id, CleanupReason::ModeChanged);
        Ok(())
    }

    /// Stop the reaper, close every stream, and kill every background process
    pub async fn shutdown(&self) {
        log::info!("Shutting down relay ({} drain loop(s) running)...", self.drain_count());
        self.streams.stop_reaper();
        for session_id in self.streams.session_ids() {
            self.streams.cleanup_session(&session_id, CleanupReason::Shutdown);
        }

        let drains: Vec<DrainTask> = self.drains.lock().drain().map(|(_, task)| task).collect();
        let waits = drains.into_iter().map(|task| async move {
            let abort = task.handle.abort_handle();
            if tokio::time::timeout(PREVIOUS_DRAIN_WAIT, task.handle).await.is_err() {
                abort.abort();
            }
        });
        futures::future::join_all(waits).await;

        let killed = self.background.kill_all().await;
        log::info!("Relay shutdown complete ({killed} background process(es) killed)");
    }

    /// Drain loops still running
    #[must_use]
    pub fn drain_count(&self) -> usize {
        self.drains.lock().len()
    }

    fn session_lock(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.session_locks.lock().entry(session_id.clone()).or_default())
    }

    /// Drop the session's chat lock unless another chat still holds or awaits it
    fn release_session_lock(&self, session_id: &SessionId) {
        let mut locks = self.session_locks.lock();
        if locks.get(session_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(session_id);
        }
    }

    /// Give the previous drain loop a bounded window to persist and exit
    async fn await_previous_drain(&self, session_id: &SessionId) {
        let Some(task) = self.drains.lock().remove(session_id) else {
            return;
        };
        if task.handle.is_finished() {
            return;
        }
        let abort = task.handle.abort_handle();
        match tokio::time::timeout(PREVIOUS_DRAIN_WAIT, task.handle).await {
            Ok(Ok(outcome)) => {
                log::debug!("[{session_id}] previous drain (generation {}) ended: {outcome:?}", task.generation);
            }
            Ok(Err(e)) => log::warn!("[{session_id}] previous drain task failed: {e}"),
            Err(_) => {
                log::warn!(
                    "[{session_id}] previous drain (generation {}) still running after {}s, aborting it",
                    task.generation,
                    PREVIOUS_DRAIN_WAIT.as_secs()
                );
                abort.abort();
            }
        }
    }
}
