//! Per-context entry store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use super::entry::{merge, ContextEntry, RegisterOptions};

/// `(source, id)`.
type EntryKey = (String, String);

/// Merged view over a set of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingContext {
    /// Entry contents in merge order, joined by the separator.
    pub merged: String,
    /// The entries, in merge order.
    pub entries: Vec<ContextEntry>,
}

impl PendingContext {
    fn from_entries(mut entries: Vec<ContextEntry>) -> Self {
        let merged = merge(&mut entries);
        Self { merged, entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects context entries keyed by originating context.
///
/// Re-registering the same `(source, id)` in a context replaces the entry.
#[derive(Debug, Default)]
pub struct ContextCollector {
    contexts: RwLock<HashMap<String, HashMap<EntryKey, ContextEntry>>>,
    next_sequence: AtomicU64,
}

impl ContextCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub async fn register(
        &self,
        context_id: &str,
        source: &str,
        id: &str,
        content: impl Into<String>,
        options: RegisterOptions,
    ) {
        let entry = ContextEntry {
            source: source.to_string(),
            id: id.to_string(),
            content: content.into(),
            priority: options.priority,
            timestamp: options.timestamp.unwrap_or_else(Utc::now),
            persistent: options.persistent,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };

        let mut contexts = self.contexts.write().await;
        let replaced = contexts
            .entry(context_id.to_string())
            .or_default()
            .insert((source.to_string(), id.to_string()), entry)
            .is_some();
        debug!(
            context_id,
            source,
            id,
            priority = %options.priority,
            persistent = options.persistent,
            replaced,
            "Context entry registered"
        );
    }

    /// Whether any entry exists for `context_id`.
    pub async fn has_pending(&self, context_id: &str) -> bool {
        self.contexts
            .read()
            .await
            .get(context_id)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// Every entry for `context_id`, merged. Leaves the store untouched.
    pub async fn get_pending(&self, context_id: &str) -> PendingContext {
        let entries = self
            .contexts
            .read()
            .await
            .get(context_id)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        PendingContext::from_entries(entries)
    }

    /// Remove and return the non-persistent entries for `context_id`.
    pub async fn consume(&self, context_id: &str) -> PendingContext {
        let mut contexts = self.contexts.write().await;
        let Some(entries) = contexts.get_mut(context_id) else {
            return PendingContext::default();
        };

        let mut taken = Vec::new();
        entries.retain(|_, entry| {
            if entry.persistent {
                return true;
            }
            taken.push(entry.clone());
            false
        });
        if entries.is_empty() {
            contexts.remove(context_id);
        }

        debug!(context_id, consumed = taken.len(), "Context entries consumed");
        PendingContext::from_entries(taken)
    }

    /// The persistent entries for `context_id`, merged. Not consumed.
    pub async fn get_persistent(&self, context_id: &str) -> PendingContext {
        let entries = self
            .contexts
            .read()
            .await
            .get(context_id)
            .map(|entries| entries.values().filter(|e| e.persistent).cloned().collect())
            .unwrap_or_default();
        PendingContext::from_entries(entries)
    }

    /// Drop every entry for `context_id`, persistent ones included.
    pub async fn clear(&self, context_id: &str) {
        if let Some(entries) = self.contexts.write().await.remove(context_id) {
            debug!(context_id, cleared = entries.len(), "Context cleared");
        }
    }

    /// Context ids that currently hold entries.
    pub async fn contexts(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.contexts.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
