//! Context entries and their ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Importance of a context entry. Declaration order is merge order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank, lowest first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        write!(f, "{s}")
    }
}

/// One fragment registered for a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextEntry {
    /// Producer that registered the entry.
    pub source: String,
    /// Producer-local entry id.
    pub id: String,
    pub content: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    /// Survives `consume` and is returned by `get_persistent`.
    pub persistent: bool,
    /// Registration order; breaks ties between equal timestamps.
    pub sequence: u64,
}

impl ContextEntry {
    /// Merge order: priority rank, then timestamp, then registration order.
    pub fn sort_key(&self) -> (u8, DateTime<Utc>, u64) {
        (self.priority.rank(), self.timestamp, self.sequence)
    }
}

/// Optional parameters for `ContextCollector::register`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    pub priority: Priority,
    pub persistent: bool,
    /// Defaults to the registration time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl RegisterOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Sort `entries` into merge order and join their contents.
pub fn merge(entries: &mut [ContextEntry]) -> String {
    entries.sort_by_key(ContextEntry::sort_key);
    entries
        .iter()
        .map(|e| e.content.as_str())
        .collect::<Vec<_>>()
        .join(super::SEPARATOR)
}
