//! In-process session service with scriptable state.
//!
//! Sessions live in a map; callers drive them by pushing messages, flipping
//! statuses and emitting events. Failures can be injected per operation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use super::{
    MessageRole, PromptRequest, SessionEvent, SessionMessage, SessionService, SessionStatus,
    SessionTodo,
};
use crate::error::SessionError;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct MemorySession {
    parent_id: Option<String>,
    title: String,
    status: SessionStatus,
    messages: Vec<SessionMessage>,
    todos: Vec<SessionTodo>,
    prompts: Vec<PromptRequest>,
    aborted: bool,
}

impl MemorySession {
    fn new(parent_id: Option<&str>, title: &str) -> Self {
        Self {
            parent_id: parent_id.map(str::to_string),
            title: title.to_string(),
            status: SessionStatus::Idle,
            messages: Vec::new(),
            todos: Vec::new(),
            prompts: Vec::new(),
            aborted: false,
        }
    }
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Create,
    Prompt,
    Messages,
    PostMessage,
    /// Status queries report the service as unavailable.
    Statuses,
}

/// Scriptable [`SessionService`] backed by memory.
pub struct InMemorySessionService {
    sessions: RwLock<HashMap<String, MemorySession>>,
    /// Messages posted into sessions that were never created here
    /// (e.g. the originating contexts of notifications).
    posted: RwLock<HashMap<String, Vec<String>>>,
    failures: RwLock<HashSet<FailPoint>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<SessionEvent>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            posted: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    /// Make every subsequent call to `point` fail.
    pub async fn fail(&self, point: FailPoint) {
        self.failures.write().await.insert(point);
    }

    /// Undo [`fail`](Self::fail).
    pub async fn recover(&self, point: FailPoint) {
        self.failures.write().await.remove(&point);
    }

    /// Register a session that exists before anyone creates it (for resume).
    pub async fn insert_session(&self, session_id: impl Into<String>, parent_id: Option<&str>) {
        self.sessions
            .write()
            .await
            .insert(session_id.into(), MemorySession::new(parent_id, "external"));
    }

    pub async fn set_status(&self, session_id: &str, status: SessionStatus) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.status = status;
        }
    }

    pub async fn push_message(&self, session_id: &str, role: MessageRole, content: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.messages.push(SessionMessage::new(role, content));
        }
    }

    pub async fn set_todos(&self, session_id: &str, todos: Vec<SessionTodo>) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.todos = todos;
        }
    }

    /// Finish a session's work: append an assistant reply and go idle.
    pub async fn finish(&self, session_id: &str, reply: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session
                .messages
                .push(SessionMessage::new(MessageRole::Assistant, reply));
            session.status = SessionStatus::Idle;
        }
    }

    /// Remove a session and announce it.
    pub async fn delete_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
        let _ = self.tx.send(SessionEvent::Deleted {
            session_id: session_id.to_string(),
        });
    }

    /// Broadcast an idle event without touching session state.
    pub fn emit_idle(&self, session_id: &str) {
        let _ = self.tx.send(SessionEvent::Idle {
            session_id: session_id.to_string(),
        });
    }

    /// Text posted into `session_id` via [`SessionService::post_message`].
    pub async fn posted(&self, session_id: &str) -> Vec<String> {
        self.posted
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Instructions submitted to a session.
    pub async fn prompts(&self, session_id: &str) -> Vec<PromptRequest> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.prompts.clone())
            .unwrap_or_default()
    }

    /// Parent context a session was created under.
    pub async fn parent_of(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.parent_id.clone())
    }

    /// Title a session was created with.
    pub async fn title_of(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.title.clone())
    }

    pub async fn is_aborted(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|s| s.aborted)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn check(&self, point: FailPoint, operation: &str) -> Result<(), SessionError> {
        if self.failures.read().await.contains(&point) {
            return Err(SessionError::RequestFailed {
                operation: operation.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn not_found(session_id: &str) -> SessionError {
        SessionError::NotFound {
            session_id: session_id.to_string(),
        }
    }
}

impl Default for InMemorySessionService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(
        &self,
        parent_id: Option<&str>,
        title: &str,
    ) -> Result<String, SessionError> {
        self.check(FailPoint::Create, "create_session").await?;
        let session_id = format!("ses_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), MemorySession::new(parent_id, title));
        debug!(session_id = %session_id, "Created in-memory session");
        Ok(session_id)
    }

    async fn prompt(&self, session_id: &str, request: PromptRequest) -> Result<(), SessionError> {
        self.check(FailPoint::Prompt, "prompt").await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Self::not_found(session_id))?;
        session
            .messages
            .push(SessionMessage::new(MessageRole::User, request.text.clone()));
        session.prompts.push(request);
        session.status = SessionStatus::Busy;
        Ok(())
    }

    async fn statuses(
        &self,
        session_ids: &[String],
    ) -> Result<HashMap<String, SessionStatus>, SessionError> {
        if self.failures.read().await.contains(&FailPoint::Statuses) {
            return Err(SessionError::Unavailable("injected failure".to_string()));
        }
        let sessions = self.sessions.read().await;
        Ok(session_ids
            .iter()
            .filter_map(|id| sessions.get(id).map(|s| (id.clone(), s.status)))
            .collect())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, SessionError> {
        self.check(FailPoint::Messages, "messages").await?;
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| Self::not_found(session_id))
    }

    async fn todos(&self, session_id: &str) -> Result<Vec<SessionTodo>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.todos.clone())
            .ok_or_else(|| Self::not_found(session_id))
    }

    async fn post_message(&self, session_id: &str, text: &str) -> Result<(), SessionError> {
        self.check(FailPoint::PostMessage, "post_message").await?;
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session
                .messages
                .push(SessionMessage::new(MessageRole::User, text));
        }
        self.posted
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    async fn abort(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Self::not_found(session_id))?;
        session.aborted = true;
        session.status = SessionStatus::Idle;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}
