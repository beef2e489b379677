//! Session stream registry
//!
//! [`SessionStreamManager`] is the single source of truth for whether a
//! session's agent invocation is alive and what is queued for it. Each entry
//! owns a message queue, a cancellation token, the invocation's control handle,
//! and a weak reference to the client connection currently attached.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::InvocationControl;
use crate::config::StreamSettings;
use crate::error::{ClaudeError, Result};
use crate::types::events::{OutboundEnvelope, ProtocolEvent};
use crate::types::identifiers::SessionId;

use super::connection::Connection;
use super::queue::{InboundMessages, MessageQueue};

/// Why a stream was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// The session was deleted
    Deleted,
    /// No activity within the idle window
    IdleTimeout,
    /// Removed to stay under the session cap
    Evicted,
    /// Working directory changed; next message respawns
    DirectoryChanged,
    /// Conversation mode changed; next message respawns
    ModeChanged,
    /// Turn aborted by the user
    Aborted,
    /// Drain loop ended normally
    Completed,
    /// Drain loop failed
    Error,
    /// Process shutting down
    Shutdown,
    /// Leftover cancelled stream replaced by a fresh one
    Replaced,
}

impl CleanupReason {
    /// Short label for logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::IdleTimeout => "idle timeout",
            Self::Evicted => "evicted",
            Self::DirectoryChanged => "directory changed",
            Self::ModeChanged => "mode changed",
            Self::Aborted => "aborted",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
            Self::Replaced => "replaced",
        }
    }
}

impl std::fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct SessionStream {
    queue: Arc<MessageQueue>,
    cancel: CancellationToken,
    invocation: Option<Arc<dyn InvocationControl>>,
    created_at: Instant,
    last_activity: Instant,
    connection: Option<Weak<dyn Connection>>,
    generation: u64,
}

/// What [`SessionStreamManager::get_or_create_stream`] hands back
#[derive(Debug, Clone)]
pub struct StreamHandle {
    /// Session the stream belongs to
    pub session_id: SessionId,
    /// Generation of the entry; distinguishes a respawned stream from its predecessor
    pub generation: u64,
    /// Consumer side of the queue
    pub messages: InboundMessages,
    /// Session-wide cancellation signal
    pub cancel: CancellationToken,
    /// Whether this call created the entry
    pub created: bool,
}

type CleanupListener = Arc<dyn Fn(&SessionId, CleanupReason) + Send + Sync>;

/// Registry of live session streams
pub struct SessionStreamManager {
    streams: Mutex<HashMap<SessionId, SessionStream>>,
    settings: StreamSettings,
    next_generation: Mutex<u64>,
    listeners: Mutex<Vec<CleanupListener>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStreamManager {
    /// Create an empty registry
    #[must_use]
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            settings,
            next_generation: Mutex::new(0),
            listeners: Mutex::new(Vec::new()),
            reaper: Mutex::new(None),
        }
    }

    /// Active settings
    #[must_use]
    pub const fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Register a callback run after every removal, outside the registry lock
    pub fn on_cleanup(&self, listener: impl Fn(&SessionId, CleanupReason) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Return the session's stream, creating it if absent
    ///
    /// Creating a stream while at the session cap first evicts the oldest
    /// streams by creation time.
    pub fn get_or_create_stream(&self, session_id: &SessionId) -> StreamHandle {
        let mut evicted = Vec::new();
        let handle = {
            let mut streams = self.streams.lock();

            if let Some(stream) = streams.get_mut(session_id) {
                stream.last_activity = Instant::now();
                return StreamHandle {
                    session_id: session_id.clone(),
                    generation: stream.generation,
                    messages: InboundMessages::new(Arc::clone(&stream.queue)),
                    cancel: stream.cancel.clone(),
                    created: false,
                };
            }

            while streams.len() >= self.settings.max_sessions.max(1) {
                let Some(oldest) = streams
                    .iter()
                    .min_by_key(|(_, s)| (s.created_at, s.generation))
                    .map(|(id, _)| id.clone())
                else {
                    break;
                };
                if let Some(stream) = streams.remove(&oldest) {
                    close(&stream);
                    evicted.push(oldest);
                }
            }

            let generation = {
                let mut next = self.next_generation.lock();
                *next += 1;
                *next
            };
            let now = Instant::now();
            let stream = SessionStream {
                queue: Arc::new(MessageQueue::new()),
                cancel: CancellationToken::new(),
                invocation: None,
                created_at: now,
                last_activity: now,
                connection: None,
                generation,
            };
            let handle = StreamHandle {
                session_id: session_id.clone(),
                generation,
                messages: InboundMessages::new(Arc::clone(&stream.queue)),
                cancel: stream.cancel.clone(),
                created: true,
            };
            streams.insert(session_id.clone(), stream);
            handle
        };

        for oldest in evicted {
            log::warn!("[{oldest}] evicted: session cap of {} reached", self.settings.max_sessions);
            self.notify_cleanup(&oldest, CleanupReason::Evicted);
        }
        log::debug!("[{session_id}] stream created (generation {})", handle.generation);
        handle
    }

    /// Enqueue a prompt for a live stream
    ///
    /// # Errors
    /// Returns `ClaudeError::StreamNotFound` when the session has no stream,
    /// or its queue was already completed
    pub fn send_message(&self, session_id: &SessionId, text: impl Into<String>) -> Result<()> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(session_id)
            .ok_or_else(|| ClaudeError::StreamNotFound(session_id.clone()))?;
        if !stream.queue.push(text.into()) {
            return Err(ClaudeError::StreamNotFound(session_id.clone()));
        }
        stream.last_activity = Instant::now();
        Ok(())
    }

    /// Remember the control handle of the invocation serving a stream
    pub fn register_invocation(
        &self,
        session_id: &SessionId,
        generation: u64,
        invocation: Arc<dyn InvocationControl>,
    ) -> bool {
        match self.streams.lock().get_mut(session_id) {
            Some(stream) if stream.generation == generation => {
                stream.invocation = Some(invocation);
                true
            }
            _ => false,
        }
    }

    /// Control handle of the session's invocation, once spawned
    #[must_use]
    pub fn invocation(&self, session_id: &SessionId) -> Option<Arc<dyn InvocationControl>> {
        self.streams
            .lock()
            .get(session_id)
            .and_then(|s| s.invocation.clone())
    }

    /// Attach `connection` as the session's outbound target, replacing any
    /// previous one; returns `false` when the session has no stream
    pub fn update_connection(&self, session_id: &SessionId, connection: &Arc<dyn Connection>) -> bool {
        match self.streams.lock().get_mut(session_id) {
            Some(stream) => {
                stream.connection = Some(Arc::downgrade(connection));
                stream.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// The attached connection, if it is still alive
    #[must_use]
    pub fn get_connection(&self, session_id: &SessionId) -> Option<Arc<dyn Connection>> {
        self.streams
            .lock()
            .get(session_id)
            .and_then(|s| s.connection.as_ref())
            .and_then(Weak::upgrade)
    }

    /// Whether the session has a stream that has not been cancelled
    #[must_use]
    pub fn is_live(&self, session_id: &SessionId) -> bool {
        self.streams
            .lock()
            .get(session_id)
            .is_some_and(|s| !s.cancel.is_cancelled() && !s.queue.is_complete())
    }

    /// Whether the session has a stream at all
    #[must_use]
    pub fn has_stream(&self, session_id: &SessionId) -> bool {
        self.streams.lock().contains_key(session_id)
    }

    /// Generation of the session's stream
    #[must_use]
    pub fn generation(&self, session_id: &SessionId) -> Option<u64> {
        self.streams.lock().get(session_id).map(|s| s.generation)
    }

    /// Bump last-activity
    pub fn touch(&self, session_id: &SessionId) {
        if let Some(stream) = self.streams.lock().get_mut(session_id) {
            stream.last_activity = Instant::now();
        }
    }

    /// Number of streams
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Whether there are no streams
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    /// Ids of every stream
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.streams.lock().keys().cloned().collect()
    }

    /// Cancel the session's current turn
    ///
    /// The stream itself survives until cleaned up. `generation_stopped` is
    /// sent only by the call that actually flips the signal, so repeated
    /// aborts are harmless. Returns whether a stream existed.
    pub fn abort_session(&self, session_id: &SessionId) -> bool {
        let first = {
            let streams = self.streams.lock();
            let Some(stream) = streams.get(session_id) else {
                return false;
            };
            let first = !stream.cancel.is_cancelled();
            stream.cancel.cancel();
            first
        };
        if first {
            log::info!("[{session_id}] generation stopped");
            self.safe_send(session_id, &ProtocolEvent::GenerationStopped);
        }
        true
    }

    /// Deliver an event if the attached connection is open; returns whether it went out
    pub fn safe_send(&self, session_id: &SessionId, event: &ProtocolEvent) -> bool {
        let Some(connection) = self.get_connection(session_id) else {
            return false;
        };
        deliver(connection.as_ref(), session_id, event)
    }

    /// Deliver straight to `connection`, bypassing the registry
    pub fn send_to(connection: &dyn Connection, session_id: &SessionId, event: &ProtocolEvent) -> bool {
        deliver(connection, session_id, event)
    }

    /// Cancel, complete the queue, and remove the entry; safe to repeat
    ///
    /// Returns whether this call removed anything.
    pub fn cleanup_session(&self, session_id: &SessionId, reason: CleanupReason) -> bool {
        let removed = self.streams.lock().remove(session_id);
        let Some(stream) = removed else {
            return false;
        };
        close(&stream);
        log::info!("[{session_id}] stream cleaned up ({reason})");
        self.notify_cleanup(session_id, reason);
        true
    }

    /// Like [`cleanup_session`](Self::cleanup_session), but only if the entry
    /// is still the given generation
    pub fn cleanup_generation(
        &self,
        session_id: &SessionId,
        generation: u64,
        reason: CleanupReason,
    ) -> bool {
        let removed = {
            let mut streams = self.streams.lock();
            match streams.get(session_id) {
                Some(stream) if stream.generation == generation => streams.remove(session_id),
                _ => None,
            }
        };
        let Some(stream) = removed else {
            log::debug!("[{session_id}] generation {generation} already replaced");
            return false;
        };
        close(&stream);
        log::info!("[{session_id}] stream cleaned up ({reason})");
        self.notify_cleanup(session_id, reason);
        true
    }

    /// Remove every stream idle for longer than the idle window; returns the ids removed
    pub fn reap_idle(&self) -> Vec<SessionId> {
        let window = self.settings.idle_timeout();
        let now = Instant::now();
        let stale: Vec<SessionId> = self
            .streams
            .lock()
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > window)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter(|id| self.cleanup_session(id, CleanupReason::IdleTimeout))
            .collect()
    }

    /// Start the idle reaper; replaces a running one
    pub fn start_reaper(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let period = self.settings.reaper_interval().max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let reaped = manager.reap_idle();
                if !reaped.is_empty() {
                    log::info!("Idle reaper removed {} stream(s)", reaped.len());
                }
            }
        });
        if let Some(previous) = self.reaper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the idle reaper
    pub fn stop_reaper(&self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }

    fn notify_cleanup(&self, session_id: &SessionId, reason: CleanupReason) {
        let listeners: Vec<CleanupListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(session_id, reason);
        }
    }
}

impl Drop for SessionStreamManager {
    fn drop(&mut self) {
        self.stop_reaper();
    }
}

fn close(stream: &SessionStream) {
    stream.cancel.cancel();
    stream.queue.complete();
}

fn deliver(connection: &dyn Connection, session_id: &SessionId, event: &ProtocolEvent) -> bool {
    if !connection.is_open() {
        return false;
    }
    let frame = match serde_json::to_string(&OutboundEnvelope { session_id, event }) {
        Ok(frame) => frame,
        Err(e) => {
            log::error!("[{session_id}] failed to serialize outbound event: {e}");
            return false;
        }
    };
    match connection.send(&frame) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("[{session_id}] dropped outbound event: {e}");
            false
        }
    }
}
