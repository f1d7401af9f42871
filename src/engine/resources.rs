use serde::Serialize;
use std::future::Future;
use tokio::task::JoinHandle;

/// A spawned task that is aborted when the guard drops.
pub(crate) struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(fut))
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Counts used by teardown and exclusivity checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounts {
    pub timers: usize,
    pub subscriptions: usize,
    pub highlight_timers: usize,
    pub fetches_in_flight: usize,
    pub polling_active: bool,
}

/// Every timer and background task owned by one engine.
#[derive(Default)]
pub(crate) struct ModeResources {
    pub(crate) quality_check: Option<TaskGuard>,
    pub(crate) reconnect: Option<TaskGuard>,
    pub(crate) polling: Option<TaskGuard>,
    pub(crate) fallback: Option<TaskGuard>,
    pub(crate) fetches: Vec<TaskGuard>,
}

impl ModeResources {
    /// Releases the timers that belong to the current mode dwell.
    pub(crate) fn release_mode(&mut self) {
        self.reconnect = None;
        self.polling = None;
        self.fallback = None;
    }

    /// Full teardown, in order: quality check, reconnect, polling, fallback,
    /// then any in-flight fetches.
    pub(crate) fn release_all(&mut self) {
        self.quality_check = None;
        self.reconnect = None;
        self.polling = None;
        self.fallback = None;
        self.fetches.clear();
    }

    pub(crate) fn track_fetch(&mut self, guard: TaskGuard) {
        self.fetches.retain(|f| !f.is_finished());
        self.fetches.push(guard);
    }

    pub(crate) fn live_timers(&self) -> usize {
        [&self.quality_check, &self.reconnect, &self.polling, &self.fallback]
            .into_iter()
            .flatten()
            .filter(|t| !t.is_finished())
            .count()
    }

    pub(crate) fn live_fetches(&self) -> usize {
        self.fetches.iter().filter(|f| !f.is_finished()).count()
    }

    pub(crate) fn polling_active(&self) -> bool {
        self.polling.as_ref().is_some_and(|t| !t.is_finished())
    }
}
