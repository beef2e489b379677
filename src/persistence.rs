//! Persistence collaborator
//!
//! The relay never touches a storage format. Everything it reads or writes
//! about a session goes through [`SessionStore`]; [`InMemorySessionStore`] backs
//! the stdio binary and the test suite.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{ClaudeError, Result};
use crate::types::identifiers::{MessageId, SessionId};
use crate::types::permissions::PermissionMode;
use crate::types::session::{ContextUsage, SessionRecord, StoredMessage};

/// Narrow interface onto persisted sessions and their messages
pub trait SessionStore: Send + Sync {
    /// Load a session
    fn get_session<'a>(&'a self, id: &'a SessionId) -> BoxFuture<'a, Result<SessionRecord>>;

    /// Store or clear the agent resume token
    fn update_resume_token<'a>(
        &'a self,
        id: &'a SessionId,
        token: Option<String>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Store the latest context-window usage
    fn update_context_usage<'a>(
        &'a self,
        id: &'a SessionId,
        usage: ContextUsage,
    ) -> BoxFuture<'a, Result<()>>;

    /// Append a message and return its id
    fn add_message<'a>(
        &'a self,
        id: &'a SessionId,
        message: StoredMessage,
    ) -> BoxFuture<'a, Result<MessageId>>;

    /// Replace a previously added message
    fn update_message<'a>(
        &'a self,
        id: &'a SessionId,
        message_id: &'a MessageId,
        content: String,
        blocks: Vec<Value>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Store the permission mode
    fn update_permission_mode<'a>(
        &'a self,
        id: &'a SessionId,
        mode: PermissionMode,
    ) -> BoxFuture<'a, Result<()>>;

    /// Store a new working directory
    fn update_working_directory<'a>(
        &'a self,
        id: &'a SessionId,
        dir: PathBuf,
    ) -> BoxFuture<'a, Result<()>>;

    /// Store a new conversation mode
    fn update_conversation_mode<'a>(
        &'a self,
        id: &'a SessionId,
        mode: Option<String>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Delete a session and its messages
    fn delete_session<'a>(&'a self, id: &'a SessionId) -> BoxFuture<'a, Result<()>>;
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<SessionId, SessionRecord>,
    messages: HashMap<SessionId, Vec<(MessageId, StoredMessage)>>,
}

/// Process-local [`SessionStore`]
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Mutex<StoreInner>,
}

impl InMemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session record
    pub fn insert_session(&self, record: SessionRecord) {
        self.inner.lock().sessions.insert(record.id.clone(), record);
    }

    /// Create the session with `working_directory` unless it already exists
    pub fn ensure_session(&self, id: &SessionId, working_directory: &Path) {
        self.inner
            .lock()
            .sessions
            .entry(id.clone())
            .or_insert_with(|| SessionRecord::new(id.clone(), working_directory));
    }

    /// Snapshot of a session record
    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<SessionRecord> {
        self.inner.lock().sessions.get(id).cloned()
    }

    /// Snapshot of a session's messages, oldest first
    #[must_use]
    pub fn messages(&self, id: &SessionId) -> Vec<StoredMessage> {
        self.inner
            .lock()
            .messages
            .get(id)
            .map(|m| m.iter().map(|(_, message)| message.clone()).collect())
            .unwrap_or_default()
    }

    fn with_session<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        let record = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| ClaudeError::session_not_found(id.as_str()))?;
        Ok(f(record))
    }
}

impl SessionStore for InMemorySessionStore {
    fn get_session<'a>(&'a self, id: &'a SessionId) -> BoxFuture<'a, Result<SessionRecord>> {
        Box::pin(async move { self.with_session(id, |record| record.clone()) })
    }

    fn update_resume_token<'a>(
        &'a self,
        id: &'a SessionId,
        token: Option<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.with_session(id, |record| record.resume_token = token) })
    }

    fn update_context_usage<'a>(
        &'a self,
        id: &'a SessionId,
        usage: ContextUsage,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.with_session(id, |record| record.context_usage = Some(usage)) })
    }

    fn add_message<'a>(
        &'a self,
        id: &'a SessionId,
        message: StoredMessage,
    ) -> BoxFuture<'a, Result<MessageId>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            if !inner.sessions.contains_key(id) {
                return Err(ClaudeError::session_not_found(id.as_str()));
            }
            let message_id = MessageId::generate();
            inner
                .messages
                .entry(id.clone())
                .or_default()
                .push((message_id.clone(), message));
            Ok(message_id)
        })
    }

    fn update_message<'a>(
        &'a self,
        id: &'a SessionId,
        message_id: &'a MessageId,
        content: String,
        blocks: Vec<Value>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            let stored = inner
                .messages
                .get_mut(id)
                .and_then(|messages| messages.iter_mut().find(|(mid, _)| mid == message_id))
                .ok_or_else(|| {
                    ClaudeError::persistence(format!("message {message_id} not found in {id}"))
                })?;
            stored.1.content = content;
            stored.1.blocks = blocks;
            stored.1.created_at = Utc::now();
            Ok(())
        })
    }

    fn update_permission_mode<'a>(
        &'a self,
        id: &'a SessionId,
        mode: PermissionMode,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.with_session(id, |record| record.permission_mode = mode) })
    }

    fn update_working_directory<'a>(
        &'a self,
        id: &'a SessionId,
        dir: PathBuf,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.with_session(id, |record| record.working_directory = dir) })
    }

    fn update_conversation_mode<'a>(
        &'a self,
        id: &'a SessionId,
        mode: Option<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.with_session(id, |record| record.conversation_mode = mode) })
    }

    fn delete_session<'a>(&'a self, id: &'a SessionId) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.messages.remove(id);
            inner
                .sessions
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| ClaudeError::session_not_found(id.as_str()))
        })
    }
}
