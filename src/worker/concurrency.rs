//! Concurrency slots. Bounds how many tasks of one category run at once.
//!
//! Each category gets its own fair semaphore, created on first use with the
//! limit the router resolves for it. A slot is a [`SlotPermit`]; dropping it
//! returns the slot, so a cancelled caller can never leak one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::routing::CategoryRouter;

/// A held concurrency slot. Released on drop.
#[derive(Debug)]
pub struct SlotPermit {
    category: String,
    _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
    pub fn category(&self) -> &str {
        &self.category
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        debug!(category = %self.category, "Slot released");
    }
}

/// Per-category counting slots.
pub struct ConcurrencyManager {
    router: CategoryRouter,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyManager {
    pub fn new(router: CategoryRouter) -> Self {
        Self {
            router,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Slot limit for `category`.
    pub fn limit(&self, category: &str) -> usize {
        self.router.resolve(category).concurrency
    }

    /// Wait for a free slot in `category`. Waiters are served in arrival
    /// order. Returns `None` once the manager is closed.
    pub async fn acquire(&self, category: &str) -> Option<SlotPermit> {
        let semaphore = self.semaphore(category);
        if semaphore.available_permits() == 0 {
            debug!(category, "Waiting for concurrency slot");
        }
        let permit = semaphore.acquire_owned().await.ok()?;
        debug!(category, in_use = self.in_use(category), "Slot acquired");
        Some(SlotPermit {
            category: category.to_string(),
            _permit: permit,
        })
    }

    /// Slots currently held in `category`.
    pub fn in_use(&self, category: &str) -> usize {
        self.lock().get(category).map_or(0, |semaphore| {
            self.limit(category)
                .saturating_sub(semaphore.available_permits())
        })
    }

    /// Wake every waiter with `None` and refuse later acquisitions. Held
    /// permits stay counted until dropped.
    pub fn close(&self) {
        for semaphore in self.lock().values() {
            semaphore.close();
        }
    }

    fn semaphore(&self, category: &str) -> Arc<Semaphore> {
        let mut semaphores = self.lock();
        Arc::clone(
            semaphores
                .entry(category.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.limit(category)))),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Semaphore>>> {
        self.semaphores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
