//! Completion notifications: decides when and how a parent context hears
//! about its finished background tasks.
//!
//! Three modes:
//! - **Immediate**: the task asked for it, or it was the only one.
//! - **Progress**: every `threshold` finished siblings, while others run.
//!   Siblings already announced on their own still count toward it.
//! - **Batch**: everything else waits until the last sibling finishes.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use uuid::Uuid;

use crate::worker::state::TaskStatus;
use crate::worker::task::BackgroundTask;

/// Kind of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Immediate,
    Progress,
    Batch,
}

/// A message to post into a parent context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub context_id: String,
    pub kind: DeliveryKind,
    /// Tasks covered by this message.
    pub task_ids: Vec<Uuid>,
    pub text: String,
}

#[derive(Debug, Clone)]
struct Finished {
    id: Uuid,
    line: String,
}

#[derive(Debug, Default)]
struct ContextBatch {
    pending: HashSet<Uuid>,
    queued: Vec<Finished>,
    total: usize,
}

impl ContextBatch {
    fn finished_count(&self) -> usize {
        self.total - self.pending.len()
    }
}

/// Per-context batching state.
#[derive(Debug, Default)]
pub struct NotificationTracker {
    batches: HashMap<String, ContextBatch>,
}

impl NotificationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting `task` as pending for its parent context.
    pub fn register(&mut self, task: &BackgroundTask) {
        let batch = self
            .batches
            .entry(task.parent_context_id.clone())
            .or_default();
        if batch.pending.insert(task.id) {
            batch.total += 1;
        }
    }

    /// A task reached `completed` or `error`. Returns the messages to send.
    pub fn finish(&mut self, task: &BackgroundTask) -> Vec<Delivery> {
        let context_id = &task.parent_context_id;
        let Some(batch) = self.batches.get_mut(context_id) else {
            return Vec::new();
        };
        if !batch.pending.remove(&task.id) {
            return Vec::new();
        }

        let finished = Finished {
            id: task.id,
            line: task.summary_line(),
        };

        if batch.pending.is_empty() {
            batch.queued.push(finished);
            return self.flush(context_id).into_iter().collect();
        }

        if task.notify.on_completion {
            return vec![Delivery {
                context_id: context_id.clone(),
                kind: DeliveryKind::Immediate,
                task_ids: vec![task.id],
                text: immediate_text(task, batch.pending.len()),
            }];
        }

        batch.queued.push(finished);
        match task.notify.threshold {
            Some(n) if n > 0 && batch.finished_count() % n == 0 => vec![Delivery {
                context_id: context_id.clone(),
                kind: DeliveryKind::Progress,
                task_ids: batch.queued.iter().map(|f| f.id).collect(),
                text: progress_text(batch),
            }],
            _ => Vec::new(),
        }
    }

    /// A task was cancelled: stop waiting for it, never announce it.
    pub fn cancel(&mut self, task: &BackgroundTask) -> Vec<Delivery> {
        let context_id = &task.parent_context_id;
        let Some(batch) = self.batches.get_mut(context_id) else {
            return Vec::new();
        };
        if !batch.pending.remove(&task.id) {
            return Vec::new();
        }
        batch.total -= 1;

        if !batch.pending.is_empty() {
            return Vec::new();
        }
        if batch.queued.is_empty() {
            self.batches.remove(context_id);
            return Vec::new();
        }
        self.flush(context_id).into_iter().collect()
    }

    /// Tasks still pending for `context_id`.
    pub fn pending_count(&self, context_id: &str) -> usize {
        self.batches
            .get(context_id)
            .map_or(0, |b| b.pending.len())
    }

    /// Finished tasks waiting for the batch flush.
    pub fn queued_count(&self, context_id: &str) -> usize {
        self.batches.get(context_id).map_or(0, |b| b.queued.len())
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }

    fn flush(&mut self, context_id: &str) -> Option<Delivery> {
        let batch = self.batches.remove(context_id)?;
        if batch.queued.is_empty() {
            return None;
        }

        let task_ids: Vec<Uuid> = batch.queued.iter().map(|f| f.id).collect();
        let kind = if batch.queued.len() == 1 {
            DeliveryKind::Immediate
        } else {
            DeliveryKind::Batch
        };
        let text = match kind {
            DeliveryKind::Immediate => format!(
                "[BACKGROUND TASK FINISHED]\n{}\n\nNo background tasks remain.",
                batch.queued[0].line
            ),
            _ => format!(
                "[ALL BACKGROUND TASKS FINISHED] {} tasks\n{}",
                batch.queued.len(),
                lines(&batch.queued)
            ),
        };

        Some(Delivery {
            context_id: context_id.to_string(),
            kind,
            task_ids,
            text,
        })
    }
}

fn immediate_text(task: &BackgroundTask, still_pending: usize) -> String {
    let header = match task.status {
        TaskStatus::Error => "[BACKGROUND TASK FAILED]",
        _ => "[BACKGROUND TASK COMPLETED]",
    };
    format!(
        "{header}\n{}\n\n{still_pending} background task(s) still running.",
        task.summary_line()
    )
}

fn progress_text(batch: &ContextBatch) -> String {
    format!(
        "[BACKGROUND TASKS PROGRESS] {} of {} tasks complete\n{}",
        batch.finished_count(),
        batch.total,
        lines(&batch.queued)
    )
}

fn lines(finished: &[Finished]) -> String {
    finished
        .iter()
        .map(|f| format!("- {}", f.line))
        .collect::<Vec<_>>()
        .join("\n")
}
