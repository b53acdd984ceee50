//! Task supervisor. Launches background tasks on remote sessions, decides
//! when they are done, and tells the originating context.
//!
//! Lifecycle of a task:
//! 1. `launch`/`resume` takes a concurrency slot, binds a session, records the
//!    task as `running` and submits the instruction in the background.
//! 2. The shared polling loop (see `poller`) and pushed idle events drive it
//!    to a terminal state. Every path goes through [`SupervisorInner::finish`],
//!    which only acts on a task that is still `running`, so the slot permit is
//!    dropped exactly once. Until the task is recorded the permit lives on the
//!    launching future, so abandoning a launch frees it.
//! 3. The notification tracker decides whether the parent context hears about
//!    it now, as progress, or in a batch with its siblings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{ConfigError, Error, TaskError};
use crate::routing::CategoryRouter;
use crate::session::{
    MessageRole, PromptRequest, SessionEvent, SessionMessage, SessionService,
};
use crate::worker::concurrency::{ConcurrencyManager, SlotPermit};
use crate::worker::notify::{Delivery, DeliveryKind, NotificationTracker};
use crate::worker::poller;
use crate::worker::state::TaskStatus;
use crate::worker::task::{BackgroundTask, CompletionSignal, LaunchRequest, TaskSummary};

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle events for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Launched {
        task_id: Uuid,
        category: String,
    },
    Completed {
        task_id: Uuid,
        signal: CompletionSignal,
    },
    Failed {
        task_id: Uuid,
        reason: String,
    },
    Cancelled {
        task_id: Uuid,
    },
    Notified {
        context_id: String,
        kind: DeliveryKind,
        task_ids: Vec<Uuid>,
    },
}

/// Shared state behind a [`TaskSupervisor`].
pub(crate) struct SupervisorInner {
    pub(super) config: SupervisorConfig,
    pub(super) router: CategoryRouter,
    pub(super) sessions: Arc<dyn SessionService>,
    pub(super) slots: ConcurrencyManager,
    pub(super) tasks: RwLock<HashMap<Uuid, BackgroundTask>>,
    /// Slot permits of running tasks. Only touched under the `tasks` write lock.
    held_slots: std::sync::Mutex<HashMap<Uuid, SlotPermit>>,
    /// Always locked before `tasks` when both are held.
    pub(super) notifications: Mutex<NotificationTracker>,
    pub(super) poller: Mutex<Option<JoinHandle<()>>>,
    pub(super) listener: Mutex<Option<JoinHandle<()>>>,
    /// Held for the duration of one polling iteration.
    pub(super) tick_guard: Mutex<()>,
    pub(super) shut_down: AtomicBool,
    pub(super) events: broadcast::Sender<TaskEvent>,
}

/// Owns the lifecycle of delegated background tasks.
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<SupervisorInner>,
}

impl TaskSupervisor {
    /// Create a supervisor driving `sessions`.
    pub fn new(
        config: SupervisorConfig,
        sessions: Arc<dyn SessionService>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let router = CategoryRouter::from_config(&config);
        let (events, _rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(SupervisorInner {
                slots: ConcurrencyManager::new(router.clone()),
                router,
                config,
                sessions,
                tasks: RwLock::new(HashMap::new()),
                held_slots: std::sync::Mutex::new(HashMap::new()),
                notifications: Mutex::new(NotificationTracker::new()),
                poller: Mutex::new(None),
                listener: Mutex::new(None),
                tick_guard: Mutex::new(()),
                shut_down: AtomicBool::new(false),
                events,
            }),
        })
    }

    /// Launch a task on a fresh remote session.
    ///
    /// Waits for a concurrency slot, then returns as soon as the task is
    /// recorded; the instruction is submitted in the background.
    pub async fn launch(&self, request: LaunchRequest) -> Result<BackgroundTask, Error> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let id = Uuid::new_v4();
        let permit = inner.acquire_slot(&request.category).await?;

        let session_id = match inner
            .sessions
            .create_session(Some(&request.parent_context_id), &request.description)
            .await
        {
            Ok(session_id) => session_id,
            Err(e) => {
                warn!(
                    category = %request.category,
                    error = %e,
                    "Failed to create session for background task"
                );
                return Err(TaskError::LaunchFailed {
                    category: request.category,
                    source: e,
                }
                .into());
            }
        };

        self.start(id, &request, session_id, permit).await
    }

    /// Continue work on an existing remote session.
    pub async fn resume(
        &self,
        session_id: &str,
        request: LaunchRequest,
    ) -> Result<BackgroundTask, Error> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let permit = inner.acquire_slot(&request.category).await?;
        self.start(Uuid::new_v4(), &request, session_id.to_string(), permit)
            .await
    }

    async fn start(
        &self,
        id: Uuid,
        request: &LaunchRequest,
        session_id: String,
        permit: SlotPermit,
    ) -> Result<BackgroundTask, Error> {
        let inner = &self.inner;
        let agent = inner.router.resolve(&request.category).agent.clone();
        let task = BackgroundTask::from_request(id, request, &agent, session_id.clone());
        inner.insert_running(task.clone(), Some(permit)).await?;

        info!(
            task_id = %id,
            session_id = %session_id,
            category = %task.category,
            agent = %agent,
            "Background task started"
        );
        let _ = inner.events.send(TaskEvent::Launched {
            task_id: id,
            category: task.category.clone(),
        });

        inner.submit(
            id,
            session_id,
            PromptRequest {
                agent,
                text: task.instruction.clone(),
            },
        );
        inner.ensure_polling().await;
        Ok(task)
    }

    /// Track a task whose session was set up elsewhere. Takes no slot.
    pub async fn track_task(&self, mut task: BackgroundTask) -> Result<(), TaskError> {
        if !task.status.is_running() {
            return Err(TaskError::InvalidTransition {
                id: task.id,
                state: task.status,
                target: TaskStatus::Running,
            });
        }
        task.holds_slot = false;
        let id = task.id;
        self.inner.insert_running(task, None).await?;
        debug!(task_id = %id, "Tracking external background task");
        self.inner.ensure_polling().await;
        Ok(())
    }

    /// Feed a session lifecycle event into completion detection.
    pub async fn handle_event(&self, event: SessionEvent) {
        self.inner.handle_event(event).await;
    }

    /// Forward the session service's event stream into
    /// [`handle_event`](Self::handle_event). Idempotent.
    pub async fn spawn_event_listener(&self) {
        let mut listener = self.inner.listener.lock().await;
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut rx = self.inner.sessions.subscribe();
        let weak = Arc::downgrade(&self.inner);
        *listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.handle_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Session event listener stopped");
        }));
    }

    /// Run one polling iteration now. Returns false if another iteration was
    /// already in flight and this one was skipped.
    pub async fn poll_once(&self) -> bool {
        self.inner.poll_once().await
    }

    /// Cancel a running task. Cancelled tasks are never announced.
    pub async fn cancel(&self, id: Uuid, reason: Option<&str>) -> Result<BackgroundTask, TaskError> {
        let inner = &self.inner;
        let mut notifications = inner.notifications.lock().await;
        let task = {
            let mut tasks = inner.tasks.write().await;
            let task = tasks.get_mut(&id).ok_or(TaskError::NotFound { id })?;
            task.transition_to(
                TaskStatus::Cancelled,
                Some(reason.unwrap_or("Cancelled").to_string()),
            )?;
            inner.release_slot(task);
            task.clone()
        };
        let deliveries = notifications.cancel(&task);
        drop(notifications);
        inner.deliver(deliveries).await;

        info!(task_id = %id, "Background task cancelled");
        let _ = inner.events.send(TaskEvent::Cancelled { task_id: id });

        if let Some(session_id) = task.session_id.as_deref()
            && let Err(e) = inner.sessions.abort(session_id).await
        {
            warn!(task_id = %id, session_id, error = %e, "Failed to abort session");
        }

        inner.schedule_removal(id);
        Ok(task)
    }

    /// Stop background activity and drop all in-memory state.
    ///
    /// Makes no remote calls and releases no slots. Launches still waiting
    /// for a slot fail with [`TaskError::ShutDown`].
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shut_down.store(true, Ordering::SeqCst);
        inner.slots.close();
        if let Some(handle) = inner.poller.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = inner.listener.lock().await.take() {
            handle.abort();
        }
        inner.notifications.lock().await.clear();
        inner.tasks.write().await.clear();
        info!("Task supervisor shut down");
    }

    pub async fn get_task(&self, id: Uuid) -> Option<BackgroundTask> {
        self.inner.tasks.read().await.get(&id).cloned()
    }

    /// Tasks launched from `context_id`, oldest first.
    pub async fn tasks_by_parent(&self, context_id: &str) -> Vec<BackgroundTask> {
        let mut tasks: Vec<_> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.parent_context_id == context_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    /// The task bound to `session_id`, preferring a running one.
    pub async fn find_by_session(&self, session_id: &str) -> Option<BackgroundTask> {
        self.inner.find_by_session(session_id).await
    }

    pub async fn running_tasks(&self) -> Vec<BackgroundTask> {
        self.inner.running_tasks().await
    }

    /// Counts of tracked tasks by status.
    pub async fn summary(&self) -> TaskSummary {
        let tasks = self.inner.tasks.read().await;
        let mut summary = TaskSummary::default();
        for task in tasks.values() {
            match task.status {
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Error => summary.error += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary.total = tasks.len();
        summary
    }

    /// Whether the polling loop is currently active.
    pub async fn is_polling(&self) -> bool {
        self.inner
            .poller
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Subscribe to task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Access to the concurrency slots.
    pub fn slots(&self) -> &ConcurrencyManager {
        &self.inner.slots
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }
}

impl SupervisorInner {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TaskError::ShutDown.into());
        }
        Ok(())
    }

    /// Take a slot in `category`, failing if the supervisor shuts down first.
    async fn acquire_slot(&self, category: &str) -> Result<SlotPermit, Error> {
        let permit = self
            .slots
            .acquire(category)
            .await
            .ok_or(TaskError::ShutDown)?;
        self.ensure_open()?;
        Ok(permit)
    }

    /// Record a running task and count it as pending for its parent. On
    /// success the task owns `permit`; on failure it is dropped.
    async fn insert_running(
        &self,
        mut task: BackgroundTask,
        permit: Option<SlotPermit>,
    ) -> Result<(), TaskError> {
        let mut notifications = self.notifications.lock().await;
        let mut tasks = self.tasks.write().await;

        if let Some(session_id) = task.session_id.as_deref()
            && let Some(existing) = tasks
                .values()
                .find(|t| t.status.is_running() && t.session_id.as_deref() == Some(session_id))
        {
            return Err(TaskError::AlreadyRunning {
                id: existing.id,
                session_id: session_id.to_string(),
            });
        }

        notifications.register(&task);
        task.holds_slot = permit.is_some();
        if let Some(permit) = permit {
            self.held_slots().insert(task.id, permit);
        }
        tasks.insert(task.id, task);
        Ok(())
    }

    /// Submit the instruction without waiting; a failed submission fails the task.
    fn submit(self: &Arc<Self>, id: Uuid, session_id: String, request: PromptRequest) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.sessions.prompt(&session_id, request).await {
                warn!(task_id = %id, session_id = %session_id, error = %e, "Instruction submission failed");
                inner.fail(id, e.to_string()).await;
            }
        });
    }

    /// Start the shared polling loop unless it is already running.
    pub(super) async fn ensure_polling(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let mut poller = self.poller.lock().await;
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *poller = Some(poller::spawn_poll_loop(
            Arc::downgrade(self),
            self.config.poll_interval,
        ));
    }

    pub(super) async fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        let Some(task) = self.find_running_by_session(event.session_id()).await else {
            return;
        };

        match event {
            SessionEvent::Idle { .. } => {
                let elapsed = task.elapsed();
                if elapsed < self.config.min_idle_time {
                    debug!(
                        task_id = %task.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Ignoring idle event before minimum idle time"
                    );
                    return;
                }
                self.try_complete(task.id, CompletionSignal::Event, None)
                    .await;
            }
            SessionEvent::Deleted { .. } => {
                self.fail(task.id, "session deleted".to_string()).await;
            }
        }
    }

    /// Complete a task if its session produced output and has no open todos.
    pub(super) async fn try_complete(
        self: &Arc<Self>,
        id: Uuid,
        signal: CompletionSignal,
        messages: Option<Vec<SessionMessage>>,
    ) -> bool {
        let Some(session_id) = self
            .tasks
            .read()
            .await
            .get(&id)
            .filter(|t| t.status.is_running())
            .and_then(|t| t.session_id.clone())
        else {
            return false;
        };

        if self.has_open_todos(&session_id).await {
            debug!(task_id = %id, signal = %signal, "Session still has open todos");
            return false;
        }

        let messages = match messages {
            Some(messages) => messages,
            None => match self.sessions.messages(&session_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    debug!(task_id = %id, error = %e, "Could not fetch messages for completion check");
                    return false;
                }
            },
        };
        if !messages.iter().any(SessionMessage::is_output) {
            debug!(task_id = %id, signal = %signal, "Session has no output yet");
            return false;
        }

        let result = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && m.is_output())
            .or_else(|| messages.iter().rev().find(|m| m.is_output()))
            .map(|m| m.content.clone());

        self.finish(id, TaskStatus::Completed, result, Some(signal))
            .await
            .is_some()
    }

    async fn has_open_todos(&self, session_id: &str) -> bool {
        match self.sessions.todos(session_id).await {
            Ok(todos) => todos.iter().any(|t| t.is_open()),
            Err(e) => {
                debug!(session_id, error = %e, "Could not fetch todos");
                false
            }
        }
    }

    pub(super) async fn fail(self: &Arc<Self>, id: Uuid, reason: String) {
        self.finish(id, TaskStatus::Error, Some(reason), None).await;
    }

    /// Move a running task to `completed` or `error`, release its slot and
    /// notify. A task that already left `running` is left alone.
    async fn finish(
        self: &Arc<Self>,
        id: Uuid,
        target: TaskStatus,
        detail: Option<String>,
        signal: Option<CompletionSignal>,
    ) -> Option<BackgroundTask> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(&id).filter(|t| t.status.is_running())?;
            task.transition_to(target, detail).ok()?;
            self.release_slot(task);
            task.clone()
        };

        match (target, signal) {
            (TaskStatus::Completed, Some(signal)) => {
                info!(
                    task_id = %id,
                    signal = %signal,
                    elapsed_secs = task.elapsed().as_secs(),
                    "Background task completed"
                );
                let _ = self.events.send(TaskEvent::Completed {
                    task_id: id,
                    signal,
                });
            }
            _ => {
                let reason = task.error.clone().unwrap_or_default();
                warn!(task_id = %id, reason = %reason, "Background task failed");
                let _ = self.events.send(TaskEvent::Failed {
                    task_id: id,
                    reason,
                });
            }
        }

        let deliveries = self.notifications.lock().await.finish(&task);
        self.deliver(deliveries).await;
        self.schedule_removal(id);
        Some(task)
    }

    fn release_slot(&self, task: &mut BackgroundTask) {
        if !std::mem::take(&mut task.holds_slot) {
            return;
        }
        if self.held_slots().remove(&task.id).is_none() {
            warn!(task_id = %task.id, category = %task.category, "Slot released while none is held");
        }
    }

    fn held_slots(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SlotPermit>> {
        self.held_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            if let Err(e) = self
                .sessions
                .post_message(&delivery.context_id, &delivery.text)
                .await
            {
                warn!(
                    context_id = %delivery.context_id,
                    error = %e,
                    "Failed to deliver background task notification"
                );
                continue;
            }
            debug!(
                context_id = %delivery.context_id,
                kind = ?delivery.kind,
                tasks = delivery.task_ids.len(),
                "Delivered background task notification"
            );
            let _ = self.events.send(TaskEvent::Notified {
                context_id: delivery.context_id,
                kind: delivery.kind,
                task_ids: delivery.task_ids,
            });
        }
    }

    /// Drop a finished task from memory once the retention window passes.
    fn schedule_removal(self: &Arc<Self>, id: Uuid) {
        let weak = Arc::downgrade(self);
        let retention = self.config.task_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(inner) = weak.upgrade() {
                let mut tasks = inner.tasks.write().await;
                if tasks.get(&id).is_some_and(|t| t.status.is_terminal()) {
                    tasks.remove(&id);
                    debug!(task_id = %id, "Removed finished task after retention");
                }
            }
        });
    }

    pub(super) async fn running_tasks(&self) -> Vec<BackgroundTask> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status.is_running())
            .cloned()
            .collect()
    }

    pub(super) async fn running_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status.is_running())
            .count()
    }

    async fn find_running_by_session(&self, session_id: &str) -> Option<BackgroundTask> {
        self.tasks
            .read()
            .await
            .values()
            .find(|t| t.status.is_running() && t.session_id.as_deref() == Some(session_id))
            .cloned()
    }

    async fn find_by_session(&self, session_id: &str) -> Option<BackgroundTask> {
        let tasks = self.tasks.read().await;
        let mut matching: Vec<_> = tasks
            .values()
            .filter(|t| t.session_id.as_deref() == Some(session_id))
            .collect();
        matching.sort_by_key(|t| (t.status.is_running(), t.started_at));
        matching.last().map(|t| (*t).clone())
    }
}
