//! Task status state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The remote session is working on the task.
    Running,
    /// The task produced output and finished.
    Completed,
    /// The task failed, went stale, or lost its session.
    Error,
    /// The task was cancelled by a caller.
    Cancelled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    ///
    /// Every path leaves `Running` exactly once; terminal states never move.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Running, Completed) | (Running, Error) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
