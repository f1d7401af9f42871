use super::state::{AcquisitionMode, TransitionReason};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The mode dwell that issued the fetch has ended.
    StaleEpoch,
    /// Newer point updates landed after the fetch was issued.
    StaleVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    Offline,
}

/// Debug hooks injected per engine. All methods default to no-ops.
///
/// `on_transition` fires once per effective mode change. A realtime entry
/// whose subscription is refused reports only the resulting fall to polling,
/// or nothing at all when the engine was already polling.
pub trait EngineObserver: Send + Sync {
    fn on_transition(&self, _from: AcquisitionMode, _to: AcquisitionMode, _reason: TransitionReason) {}
    fn on_fetch_discarded(&self, _reason: DiscardReason) {}
    fn on_tick_skipped(&self, _reason: SkipReason) {}
    fn on_reconnect_scheduled(&self, _delay: Duration) {}
}

pub struct NoopObserver;

impl EngineObserver for NoopObserver {}
