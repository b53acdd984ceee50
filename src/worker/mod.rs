//! Background task supervision.
//!
//! Core components:
//! - `task` — Task records, launch requests, notification policy
//! - `state` — Task status state machine (Running → Completed/Error/Cancelled)
//! - `concurrency` — Per-category slots with FIFO waiters
//! - `notify` — Immediate, progress and batched completion notices
//! - `poller` — The shared polling loop (stale, idle and stability checks)
//! - `supervisor` — Launch, track, cancel and shut down tasks

pub mod concurrency;
pub mod notify;
mod poller;
pub mod state;
pub mod supervisor;
pub mod task;

pub use concurrency::ConcurrencyManager;
pub use notify::{Delivery, DeliveryKind, NotificationTracker};
pub use state::TaskStatus;
pub use supervisor::{TaskEvent, TaskSupervisor};
pub use task::{BackgroundTask, CompletionSignal, LaunchRequest, NotifyPolicy, TaskSummary};
