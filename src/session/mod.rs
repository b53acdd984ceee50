//! Remote session service contract.
//!
//! The supervisor never talks to a concrete backend; it drives whatever
//! implements [`SessionService`]. [`memory::InMemorySessionService`] is a
//! scriptable in-process implementation.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::SessionError;

pub use memory::InMemorySessionService;

/// Remote session status as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
}

/// Who produced a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

/// One message in a remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
}

impl SessionMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Whether this message counts as output produced by the session.
    pub fn is_output(&self) -> bool {
        matches!(self.role, MessageRole::Assistant | MessageRole::Tool)
            && !self.content.trim().is_empty()
    }
}

/// State of a sub-task tracked inside a remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoState {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

/// A sub-task ("todo") a remote session is working through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTodo {
    pub content: String,
    pub state: TodoState,
}

impl SessionTodo {
    pub fn new(content: impl Into<String>, state: TodoState) -> Self {
        Self {
            content: content.into(),
            state,
        }
    }

    /// Whether the todo still needs work.
    pub fn is_open(&self) -> bool {
        matches!(self.state, TodoState::Pending | TodoState::InProgress)
    }
}

/// Instruction submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Agent that should handle the instruction.
    pub agent: String,
    /// Full instruction text.
    pub text: String,
}

/// Lifecycle events pushed by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session finished processing and is waiting for input.
    Idle { session_id: String },
    /// The session no longer exists.
    Deleted { session_id: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Idle { session_id } | Self::Deleted { session_id } => session_id,
        }
    }
}

/// Remote session service consumed by the supervisor.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Create a session, optionally scoped under a parent context.
    async fn create_session(
        &self,
        parent_id: Option<&str>,
        title: &str,
    ) -> Result<String, SessionError>;

    /// Submit an instruction. Returns once the service accepted it; execution
    /// continues remotely.
    async fn prompt(&self, session_id: &str, request: PromptRequest) -> Result<(), SessionError>;

    /// Status of each requested session. Sessions the service does not know
    /// are absent from the map.
    async fn statuses(
        &self,
        session_ids: &[String],
    ) -> Result<HashMap<String, SessionStatus>, SessionError>;

    /// Full message list of a session.
    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, SessionError>;

    /// Sub-tasks tracked by a session.
    async fn todos(&self, session_id: &str) -> Result<Vec<SessionTodo>, SessionError>;

    /// Post a text message into an existing session.
    async fn post_message(&self, session_id: &str, text: &str) -> Result<(), SessionError>;

    /// Stop whatever the session is doing.
    async fn abort(&self, session_id: &str) -> Result<(), SessionError>;

    /// Subscribe to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}
