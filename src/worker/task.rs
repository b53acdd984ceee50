//! Background task records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::TaskError;
use crate::worker::state::TaskStatus;

/// When the originating context hears about a finished task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyPolicy {
    /// Deliver a standalone notification as soon as this task finishes,
    /// instead of waiting for its siblings.
    pub on_completion: bool,
    /// Send a progress message every time this many sibling tasks have
    /// finished (while others are still pending).
    pub threshold: Option<usize>,
}

/// Which completion signal finished a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    /// A pushed idle event past the minimum idle time.
    Event,
    /// The polling loop saw the session idle.
    Poll,
    /// The message count stopped changing.
    Stability,
}

impl std::fmt::Display for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Event => "event",
            Self::Poll => "poll",
            Self::Stability => "stability",
        };
        write!(f, "{s}")
    }
}

/// Polling bookkeeping.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    /// Monotonic start, used for every runtime threshold.
    pub started: Instant,
    /// Message count seen by the last poll.
    pub last_message_count: usize,
    /// Consecutive polls with an unchanged message count.
    pub stable_polls: u32,
    /// Last time the message count changed.
    pub last_activity: Instant,
    /// When the task left `running`.
    pub finished: Option<Instant>,
}

impl TaskProgress {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_message_count: 0,
            stable_polls: 0,
            last_activity: now,
            finished: None,
        }
    }

    /// Record a poll's message count. Returns true if the count changed.
    ///
    /// Stable polls only accumulate once `track_stability` is set; a change
    /// always resets the counter.
    pub fn observe(&mut self, message_count: usize, track_stability: bool) -> bool {
        if message_count != self.last_message_count {
            self.last_message_count = message_count;
            self.stable_polls = 0;
            self.last_activity = Instant::now();
            return true;
        }
        if track_stability {
            self.stable_polls += 1;
        }
        false
    }

    /// Time since the last observed activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// One unit of delegated remote work.
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundTask {
    /// Unique task ID.
    pub id: Uuid,
    /// Context the task was launched from; notifications go here.
    pub parent_context_id: String,
    /// Request inside the parent context that launched the task.
    pub parent_request_id: String,
    /// Short human description.
    pub description: String,
    /// Full instruction text.
    pub instruction: String,
    /// Concurrency key.
    pub category: String,
    /// Agent resolved for the category.
    pub agent: String,
    /// Current status.
    pub status: TaskStatus,
    /// When the task started.
    pub started_at: DateTime<Utc>,
    /// When the task left `running`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Final output of a completed task.
    pub result: Option<String>,
    /// Failure description of an errored or cancelled task.
    pub error: Option<String>,
    /// Remote session doing the work.
    pub session_id: Option<String>,
    /// Notification policy.
    pub notify: NotifyPolicy,
    #[serde(skip)]
    pub progress: TaskProgress,
    #[serde(skip)]
    pub(crate) holds_slot: bool,
}

impl BackgroundTask {
    /// Create a running task bound to a remote session.
    pub fn new(
        parent_context_id: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_context_id: parent_context_id.into(),
            parent_request_id: String::new(),
            description: description.into(),
            instruction: String::new(),
            category: category.into(),
            agent: String::new(),
            status: TaskStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            session_id: Some(session_id.into()),
            notify: NotifyPolicy::default(),
            progress: TaskProgress::new(),
            holds_slot: false,
        }
    }

    pub(crate) fn from_request(
        id: Uuid,
        request: &LaunchRequest,
        agent: &str,
        session_id: String,
    ) -> Self {
        Self {
            id,
            parent_request_id: request.parent_request_id.clone(),
            instruction: request.instruction.clone(),
            agent: agent.to_string(),
            notify: request.notify,
            holds_slot: true,
            ..Self::new(
                request.parent_context_id.clone(),
                request.description.clone(),
                request.category.clone(),
                session_id,
            )
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.parent_request_id = request_id.into();
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_notify(mut self, notify: NotifyPolicy) -> Self {
        self.notify = notify;
        self
    }

    /// Runtime so far (or total runtime once finished).
    pub fn elapsed(&self) -> Duration {
        match self.progress.finished {
            Some(end) => end.duration_since(self.progress.started),
            None => self.progress.started.elapsed(),
        }
    }

    /// Whether the task currently holds a concurrency slot.
    pub fn holds_slot(&self) -> bool {
        self.holds_slot
    }

    /// Move out of `running`. `detail` is the result for `Completed` and the
    /// error text otherwise.
    pub fn transition_to(
        &mut self,
        target: TaskStatus,
        detail: Option<String>,
    ) -> Result<(), TaskError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                state: self.status,
                target,
            });
        }

        self.status = target;
        self.completed_at = Some(Utc::now());
        self.progress.finished = Some(Instant::now());
        match target {
            TaskStatus::Completed => self.result = detail,
            _ => self.error = detail,
        }
        Ok(())
    }

    /// One-line summary used in notifications.
    pub fn summary_line(&self) -> String {
        let secs = self.elapsed().as_secs();
        match self.status {
            TaskStatus::Completed => format!(
                "✓ \"{}\" completed in {}s (task {})",
                self.description, secs, self.id
            ),
            TaskStatus::Error => format!(
                "✗ \"{}\" failed after {}s: {} (task {})",
                self.description,
                secs,
                self.error.as_deref().unwrap_or("unknown error"),
                self.id
            ),
            TaskStatus::Cancelled => {
                format!("\"{}\" was cancelled (task {})", self.description, self.id)
            }
            TaskStatus::Running => {
                format!("\"{}\" is still running (task {})", self.description, self.id)
            }
        }
    }
}

/// Input to [`TaskSupervisor::launch`](crate::worker::TaskSupervisor::launch)
/// and [`resume`](crate::worker::TaskSupervisor::resume).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub description: String,
    pub instruction: String,
    pub category: String,
    pub parent_context_id: String,
    pub parent_request_id: String,
    pub notify: NotifyPolicy,
}

impl LaunchRequest {
    pub fn new(
        description: impl Into<String>,
        instruction: impl Into<String>,
        category: impl Into<String>,
        parent_context_id: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            instruction: instruction.into(),
            category: category.into(),
            parent_context_id: parent_context_id.into(),
            parent_request_id: String::new(),
            notify: NotifyPolicy::default(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.parent_request_id = request_id.into();
        self
    }

    /// Notify as soon as this task finishes.
    pub fn notify_on_completion(mut self) -> Self {
        self.notify.on_completion = true;
        self
    }

    /// Send progress messages every `threshold` finished siblings.
    pub fn with_notification_threshold(mut self, threshold: usize) -> Self {
        self.notify.threshold = Some(threshold);
        self
    }
}

/// Counts of tracked tasks by status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_records_result_and_timestamp() {
        let mut task = BackgroundTask::new("ctx", "Review", "review", "ses_1");
        assert_eq!(task.status, TaskStatus::Running);

        task.transition_to(TaskStatus::Completed, Some("looks good".into()))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("looks good"));
        assert!(task.error.is_none());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn second_transition_is_rejected() {
        let mut task = BackgroundTask::new("ctx", "Review", "review", "ses_1");
        task.transition_to(TaskStatus::Error, Some("boom".into()))
            .unwrap();
        let err = task
            .transition_to(TaskStatus::Completed, None)
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition {
                state: TaskStatus::Error,
                target: TaskStatus::Completed,
                ..
            }
        ));
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_tracks_stability_and_activity() {
        let mut progress = TaskProgress::new();
        assert!(progress.observe(2, false));
        assert!(!progress.observe(2, false));
        assert_eq!(progress.stable_polls, 0);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!progress.observe(2, true));
        assert!(!progress.observe(2, true));
        assert_eq!(progress.stable_polls, 2);
        assert_eq!(progress.idle_for(), Duration::from_secs(4));

        assert!(progress.observe(3, true));
        assert_eq!(progress.stable_polls, 0);
        assert_eq!(progress.idle_for(), Duration::ZERO);
    }

    #[test]
    fn request_builders() {
        let request = LaunchRequest::new("d", "i", "review", "ctx")
            .with_request_id("msg_1")
            .notify_on_completion()
            .with_notification_threshold(2);
        assert_eq!(request.parent_request_id, "msg_1");
        assert!(request.notify.on_completion);
        assert_eq!(request.notify.threshold, Some(2));

        let task = BackgroundTask::from_request(Uuid::new_v4(), &request, "reviewer", "ses_9".into());
        assert_eq!(task.agent, "reviewer");
        assert_eq!(task.session_id.as_deref(), Some("ses_9"));
        assert!(task.holds_slot());
    }

    #[test]
    fn summary_line_mentions_failure_reason() {
        let mut task = BackgroundTask::new("ctx", "Build", "build", "ses_1");
        task.transition_to(TaskStatus::Error, Some("session unavailable".into()))
            .unwrap();
        assert!(task.summary_line().contains("session unavailable"));
        assert!(task.summary_line().contains("Build"));
    }
}
