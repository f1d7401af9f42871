use crate::models::ItemId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

struct HighlightEntry {
    token: u64,
    timer: JoinHandle<()>,
}

struct HighlightInner {
    entries: HashMap<ItemId, HighlightEntry>,
    next_token: u64,
    alive: bool,
}

/// Tracks items that changed recently. Each id owns at most one expiry
/// timer; re-marking replaces it under the same lock.
#[derive(Clone)]
pub struct UpdateHighlightTracker {
    inner: Arc<Mutex<HighlightInner>>,
}

impl Default for UpdateHighlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateHighlightTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HighlightInner {
                entries: HashMap::new(),
                next_token: 0,
                alive: true,
            })),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn mark_updated(&self, id: ItemId, duration: Duration) {
        let mut inner = lock(&self.inner);
        if !inner.alive {
            return;
        }
        if let Some(previous) = inner.entries.remove(&id) {
            previous.timer.abort();
        }

        inner.next_token += 1;
        let token = inner.next_token;
        let weak: Weak<Mutex<HighlightInner>> = Arc::downgrade(&self.inner);
        let key = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let Some(shared) = weak.upgrade() else { return };
            let mut inner = lock(&shared);
            // A stale timer must not remove a newer highlight for the same id
            if inner.alive && inner.entries.get(&key).is_some_and(|e| e.token == token) {
                inner.entries.remove(&key);
            }
        });
        inner.entries.insert(id, HighlightEntry { token, timer });
    }

    pub fn clear(&self, id: &ItemId) {
        if let Some(entry) = lock(&self.inner).entries.remove(id) {
            entry.timer.abort();
        }
    }

    pub fn clear_all(&self) {
        let mut inner = lock(&self.inner);
        for entry in inner.entries.values() {
            entry.timer.abort();
        }
        inner.entries.clear();
    }

    /// Stops accepting marks and cancels every pending timer.
    pub fn shutdown(&self) {
        lock(&self.inner).alive = false;
        self.clear_all();
    }

    pub fn is_highlighted(&self, id: &ItemId) -> bool {
        lock(&self.inner).entries.contains_key(id)
    }

    pub fn highlighted(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = lock(&self.inner).entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pending_timers(&self) -> usize {
        lock(&self.inner)
            .entries
            .values()
            .filter(|e| !e.timer.is_finished())
            .count()
    }
}

fn lock(inner: &Mutex<HighlightInner>) -> MutexGuard<'_, HighlightInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
