//! Context aggregation. Per-context text fragments from independent
//! producers, merged by priority and recency for injection into a session.

pub mod collector;
pub mod entry;

pub use collector::{ContextCollector, PendingContext};
pub use entry::{ContextEntry, Priority, RegisterOptions};

/// Separator placed between merged entries.
pub const SEPARATOR: &str = "\n\n---\n\n";
