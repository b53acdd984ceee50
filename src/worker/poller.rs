//! The shared polling loop and per-task completion checks.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::SessionStatus;
use crate::worker::supervisor::SupervisorInner;
use crate::worker::task::{BackgroundTask, CompletionSignal};

/// Spawn the polling loop. It exits once no task is running or the
/// supervisor is dropped.
pub(crate) fn spawn_poll_loop(
    inner: Weak<SupervisorInner>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Background task polling started");
        // First tick one interval from now, not immediately.
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else { break };
            inner.poll_once().await;
            if inner.stop_polling_if_idle().await {
                break;
            }
        }
        info!("Background task polling stopped");
    })
}

impl SupervisorInner {
    /// One polling iteration over every running task.
    pub(super) async fn poll_once(self: &Arc<Self>) -> bool {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            debug!("Previous poll still in flight, skipping tick");
            return false;
        };

        let running = self.running_tasks().await;
        if running.is_empty() {
            return true;
        }

        let session_ids: Vec<String> = running
            .iter()
            .filter_map(|t| t.session_id.clone())
            .collect();
        let statuses = match self.sessions.statuses(&session_ids).await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(error = %e, "Failed to fetch session statuses");
                HashMap::new()
            }
        };

        futures::future::join_all(running.iter().map(|task| {
            let status = task
                .session_id
                .as_ref()
                .and_then(|id| statuses.get(id).copied());
            self.poll_task(task, status)
        }))
        .await;
        true
    }

    async fn poll_task(self: &Arc<Self>, task: &BackgroundTask, status: Option<SessionStatus>) {
        let Some(session_id) = task.session_id.as_deref() else {
            return;
        };
        let elapsed = task.elapsed();
        let config = &self.config;

        if elapsed >= config.min_runtime_before_stale
            && task.progress.idle_for() >= config.stale_timeout
        {
            warn!(
                task_id = %task.id,
                idle_secs = task.progress.idle_for().as_secs(),
                "Background task went stale"
            );
            self.fail(task.id, stale_message(config.stale_timeout)).await;
            return;
        }

        let messages = match self.sessions.messages(session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                self.fail(task.id, format!("session unavailable: {e}")).await;
                return;
            }
        };

        let track_stability = elapsed >= config.min_stability_time;
        let Some(stable_polls) = self
            .record_progress(task.id, messages.len(), track_stability)
            .await
        else {
            return;
        };

        if status == Some(SessionStatus::Idle)
            && self
                .try_complete(task.id, CompletionSignal::Poll, Some(messages.clone()))
                .await
        {
            return;
        }

        if track_stability && stable_polls >= config.stable_polls_required {
            debug!(task_id = %task.id, stable_polls, "Message count stable");
            self.try_complete(task.id, CompletionSignal::Stability, Some(messages))
                .await;
        }
    }

    /// Update a running task's counters; returns its stable poll count.
    async fn record_progress(
        &self,
        id: Uuid,
        message_count: usize,
        track_stability: bool,
    ) -> Option<u32> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).filter(|t| t.status.is_running())?;
        if task.progress.observe(message_count, track_stability) {
            debug!(task_id = %id, message_count, "Session activity");
        }
        Some(task.progress.stable_polls)
    }

    /// Clear the loop handle when nothing is left to poll. Returns true if
    /// the loop should exit.
    pub(super) async fn stop_polling_if_idle(&self) -> bool {
        let mut poller = self.poller.lock().await;
        if self.running_count().await > 0 {
            return false;
        }
        *poller = None;
        true
    }
}

fn stale_message(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    match secs {
        60 => "no activity for 1 minute".to_string(),
        s if s >= 60 && s % 60 == 0 => format!("no activity for {} minutes", s / 60),
        s => format!("no activity for {s} seconds"),
    }
}
