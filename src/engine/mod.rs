//! Acquisition mode controller.
//!
//! Each engine is an actor task that owns every piece of mutable state for a
//! single vote: mode, quality, items, timers and the realtime subscription.
//! Timers, fetches and the transport only ever talk to it through channels,
//! so every handler runs to completion before the next message is taken and
//! a mode transition (teardown + activate) can never interleave with another.

pub mod observer;
pub(crate) mod resources;
pub mod state;

pub use observer::{DiscardReason, EngineObserver, NoopObserver, SkipReason};
pub use resources::ResourceCounts;
pub use state::{AcquisitionMode, AcquisitionState, TransitionReason};

use crate::config::EngineConfig;
use crate::error::{ConfigError, TransportError};
use crate::highlight::UpdateHighlightTracker;
use crate::models::{ChangeEvent, ChangeKind, ItemId, TallySnapshot, UserId, UserVoteRecord, VoteId, VoteTallyItem};
use crate::notify::{LogNotifier, Notification, NotificationKind, NotificationSink};
use crate::polling::{FetchOutcome, FetchPurpose, PollingAcquirer, TallySource};
use crate::quality::{ConnectionQuality, ConnectionQualityTracker};
use crate::signals::SystemSignals;
use crate::transport::{
    topic_for, PushTransport, RealtimeSubscriptionAdapter, TaggedSignal, TransportSignal, TransportStatus,
};
use crate::voting::{ranking, RankedItem, SubjectDirectory};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use resources::{ModeResources, TaskGuard};
use state::{realtime_downgrade, recovery_gate, should_escalate};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

const MAX_RESYNC_RETRIES: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct PollingStats {
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

/// Everything a presenter needs, published after every handled message.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub vote_id: VoteId,
    pub state: AcquisitionState,
    pub quality: ConnectionQuality,
    pub signals: SystemSignals,
    pub items: Vec<VoteTallyItem>,
    pub user_votes: Vec<UserVoteRecord>,
    pub polling: PollingStats,
    pub data_version: u64,
    pub resources: ResourceCounts,
}

enum Command {
    ModeRequested,
    Refresh,
    Shutdown,
}

enum Internal {
    PollTick { epoch: u64 },
    FallbackExpired { epoch: u64 },
    QualityCheck,
    ReconnectDue { epoch: u64 },
    FetchDone {
        epoch: u64,
        version: u64,
        purpose: FetchPurpose,
        outcome: FetchOutcome,
    },
}

pub struct EngineBuilder {
    vote_id: VoteId,
    user_id: Option<UserId>,
    config: EngineConfig,
    source: Arc<dyn TallySource>,
    transport: Arc<dyn PushTransport>,
    notifier: Arc<dyn NotificationSink>,
    observer: Arc<dyn EngineObserver>,
    signals: Option<watch::Receiver<SystemSignals>>,
}

impl EngineBuilder {
    pub fn new(vote_id: VoteId, source: Arc<dyn TallySource>, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            vote_id,
            user_id: None,
            config: EngineConfig::default(),
            source,
            transport,
            notifier: Arc::new(LogNotifier),
            observer: Arc::new(NoopObserver),
            signals: None,
        }
    }

    pub fn user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn signals(mut self, signals: watch::Receiver<SystemSignals>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Starts the engine on the current tokio runtime. Invalid configuration
    /// never panics: the engine comes up in static mode with no acquisition.
    pub fn spawn(self) -> EngineHandle {
        let id = Uuid::new_v4();
        let label = format!("{}/{}", &id.simple().to_string()[..8], self.vote_id);

        let startup_error = if self.vote_id.is_blank() {
            Some(ConfigError::MissingVoteId.to_string())
        } else {
            self.config.validate().err().map(|e| e.to_string())
        };
        let initial_mode = match (&startup_error, self.config.enable_realtime) {
            (Some(_), _) => AcquisitionMode::Static,
            (None, true) => AcquisitionMode::Realtime,
            (None, false) => AcquisitionMode::Polling,
        };

        let alive = Arc::new(AtomicBool::new(true));
        let requested_mode = Arc::new(Mutex::new(None));
        let highlights = UpdateHighlightTracker::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let signals = self
            .signals
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default();
        let mut state = AcquisitionState::new(initial_mode);
        state.startup_error = startup_error;

        let poller = PollingAcquirer::new(
            self.source,
            self.vote_id.clone(),
            self.user_id,
            self.config.request_timeout,
            self.config.personal_refresh_interval,
        );

        let mut actor = EngineActor {
            label,
            topic: topic_for(&self.vote_id),
            vote_id: self.vote_id,
            poll_period: self.config.polling_interval,
            config: self.config,
            state,
            quality: ConnectionQualityTracker::new(),
            signals,
            items: Vec::new(),
            user_votes: Vec::new(),
            has_snapshot: false,
            data_version: 0,
            epoch: 0,
            reconnect_attempt: false,
            resync_retries: 0,
            resync_pending: false,
            subscribed_at: None,
            poller,
            adapter: RealtimeSubscriptionAdapter::new(self.transport, transport_tx),
            resources: ModeResources::default(),
            highlights: highlights.clone(),
            notifier: self.notifier,
            observer: self.observer,
            alive: Arc::clone(&alive),
            requested_mode: Arc::clone(&requested_mode),
            internal: internal_tx,
        };
        actor.boot();

        let (snapshot_tx, snapshot_rx) = watch::channel(actor.snapshot());
        let task = tokio::spawn(actor.run(command_rx, internal_rx, transport_rx, self.signals, snapshot_tx));

        EngineHandle {
            id,
            commands: command_tx,
            requested_mode,
            snapshot: snapshot_rx,
            highlights,
            alive,
            task: Some(task),
        }
    }
}

pub struct EngineHandle {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    requested_mode: Arc<Mutex<Option<AcquisitionMode>>>,
    snapshot: watch::Receiver<EngineSnapshot>,
    highlights: UpdateHighlightTracker,
    alive: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Requests an explicit mode. Requests made before the engine gets to
    /// them collapse into the latest one.
    pub fn switch_mode(&self, mode: AcquisitionMode) {
        *self
            .requested_mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(mode);
        let _ = self.commands.send(Command::ModeRequested);
    }

    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.clone()
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.snapshot.borrow().state.mode
    }

    pub fn ranked(&self, search: Option<&str>, names: &dyn SubjectDirectory) -> Vec<RankedItem> {
        ranking::project(&self.snapshot.borrow().items, search, names)
    }

    pub fn is_highlighted(&self, id: &ItemId) -> bool {
        self.highlights.is_highlighted(id)
    }

    pub fn highlights(&self) -> UpdateHighlightTracker {
        self.highlights.clone()
    }

    /// Tears everything down in order and reports what is still alive
    /// afterwards (all zero on a clean shutdown).
    pub async fn shutdown(mut self) -> ResourceCounts {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("engine {} task ended abnormally: {}", self.id, e);
            }
        }
        let mut counts = self.snapshot.borrow().resources;
        counts.highlight_timers = self.highlights.pending_timers();
        counts
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            // Dropping the actor releases its timers and subscription
            task.abort();
        }
        self.highlights.shutdown();
    }
}

struct EngineActor {
    label: String,
    vote_id: VoteId,
    topic: String,
    config: EngineConfig,
    state: AcquisitionState,
    quality: ConnectionQualityTracker,
    signals: SystemSignals,
    items: Vec<VoteTallyItem>,
    user_votes: Vec<UserVoteRecord>,
    has_snapshot: bool,
    data_version: u64,
    // Bumped on every mode entry; results and timers from older epochs are dropped
    epoch: u64,
    reconnect_attempt: bool,
    resync_retries: u32,
    // A resync was refused while another fetch held the slot
    resync_pending: bool,
    subscribed_at: Option<Instant>,
    poll_period: Duration,
    poller: PollingAcquirer,
    adapter: RealtimeSubscriptionAdapter,
    resources: ModeResources,
    highlights: UpdateHighlightTracker,
    notifier: Arc<dyn NotificationSink>,
    observer: Arc<dyn EngineObserver>,
    alive: Arc<AtomicBool>,
    requested_mode: Arc<Mutex<Option<AcquisitionMode>>>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl EngineActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut transport: mpsc::UnboundedReceiver<TaggedSignal>,
        mut signals: Option<watch::Receiver<SystemSignals>>,
        snapshot_tx: watch::Sender<EngineSnapshot>,
    ) {
        loop {
            let mut signals_closed = false;
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.shutdown();
                        snapshot_tx.send_replace(self.snapshot());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(message) = internal.recv() => {
                    if self.alive.load(Ordering::Acquire) {
                        self.handle_internal(message);
                    }
                }
                Some(tagged) = transport.recv() => self.handle_transport(tagged),
                next = next_signals(&mut signals) => match next {
                    Some(next) => self.apply_signals(next),
                    None => signals_closed = true,
                },
            }
            if signals_closed {
                signals = None;
            }
            snapshot_tx.send_replace(self.snapshot());
        }
    }

    fn boot(&mut self) {
        if let Some(reason) = self.state.startup_error.clone() {
            error!("[{}] refusing to start acquisition: {}", self.label, reason);
            self.notifier.notify(Notification::new(
                NotificationKind::Error,
                "Live results unavailable",
                reason,
            ));
            return;
        }

        info!("[{}] starting in {} mode", self.label, self.state.mode);
        self.resources.quality_check =
            Some(self.every(self.config.quality_check_interval, || Internal::QualityCheck));

        let mode = self.state.mode;
        if let Err(e) = self.activate(mode) {
            self.enter_polling_instead(None, e);
        }
    }

    // --- Mode lifecycle ---

    fn activate(&mut self, mode: AcquisitionMode) -> Result<(), TransportError> {
        self.epoch += 1;
        self.state.mode = mode;
        self.state.is_connected = false;
        self.state.polling_started = None;

        match mode {
            AcquisitionMode::Realtime => {
                self.poller.set_realtime_active(true);
                self.adapter.subscribe(&self.topic)?;
                self.state.error_count = 0;
                self.subscribed_at = Some(Instant::now());
                let epoch = self.epoch;
                self.resources.fallback = Some(self.after(
                    self.config.realtime_fallback_timeout,
                    Internal::FallbackExpired { epoch },
                ));
                if !self.has_snapshot {
                    self.start_fetch(FetchPurpose::Initial);
                }
            }
            AcquisitionMode::Polling => {
                self.poller.set_realtime_active(false);
                self.state.error_count = 0;
                self.state.polling_started = Some(Instant::now());
                self.start_fetch(FetchPurpose::Poll);
                self.arm_polling();
            }
            AcquisitionMode::Static => {
                self.poller.set_realtime_active(false);
                self.state.error_count = 0;
            }
        }
        Ok(())
    }

    fn teardown_mode(&mut self) {
        self.resources.release_mode();
        self.adapter.unsubscribe();
        self.poller.abandon();
        self.resync_pending = false;
        self.subscribed_at = None;
        self.state.is_connected = false;
    }

    fn transition(&mut self, target: AcquisitionMode, reason: TransitionReason) {
        let from = self.state.mode;
        if from == target {
            debug!("[{}] already in {} mode", self.label, target);
            return;
        }
        if from == AcquisitionMode::Realtime && self.reconnect_attempt && reason != TransitionReason::Explicit {
            self.state.retry_count += 1;
        }
        self.reconnect_attempt = reason == TransitionReason::Recovery;

        info!("[{}] {} -> {} ({})", self.label, from, target, reason);
        self.teardown_mode();
        if let Err(e) = self.activate(target) {
            self.enter_polling_instead(Some(from), e);
            return;
        }
        self.observer.on_transition(from, target, reason);
        self.notifier.notify(mode_notice(from, target, reason));
    }

    /// Realtime could not be entered, so polling takes over. Observers see a
    /// single transition out of `live`, the mode that was actually running,
    /// and none when that was already polling or nothing had started yet.
    fn enter_polling_instead(&mut self, live: Option<AcquisitionMode>, error: TransportError) {
        warn!("[{}] could not enter realtime mode: {}", self.label, error);
        self.record_failure();
        if self.reconnect_attempt {
            self.reconnect_attempt = false;
            self.state.retry_count += 1;
        }

        self.teardown_mode();
        if let Err(e) = self.activate(AcquisitionMode::Polling) {
            error!("[{}] polling could not start: {}", self.label, e);
        }

        let reason = TransitionReason::TransportFailure;
        match live {
            Some(from) if from != AcquisitionMode::Polling => {
                info!("[{}] {} -> {} ({})", self.label, from, AcquisitionMode::Polling, reason);
                self.observer.on_transition(from, AcquisitionMode::Polling, reason);
                self.notifier.notify(mode_notice(from, AcquisitionMode::Polling, reason));
            }
            _ => self.notifier.notify(Notification::new(
                NotificationKind::Warning,
                "Live updates unavailable",
                error.to_string(),
            )),
        }
    }

    fn restart_realtime(&mut self) {
        info!("[{}] re-subscribing realtime", self.label);
        self.teardown_mode();
        if let Err(e) = self.activate(AcquisitionMode::Realtime) {
            self.enter_polling_instead(Some(AcquisitionMode::Realtime), e);
        }
    }

    fn shutdown(&mut self) {
        info!("[{}] shutting down", self.label);
        self.alive.store(false, Ordering::Release);
        self.resources.quality_check = None;
        self.resources.reconnect = None;
        self.resources.polling = None;
        self.resources.fallback = None;
        self.adapter.unsubscribe();
        self.highlights.shutdown();
        self.resources.release_all();
        self.poller.abandon();
        self.state.is_connected = false;
    }

    // --- Message handlers ---

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ModeRequested => {
                let requested = self
                    .requested_mode
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                // Nothing left means an earlier wake-up already took the latest target
                let Some(target) = requested else { return };
                if self.state.startup_error.is_some() {
                    warn!("[{}] ignoring switch to {}: engine did not start", self.label, target);
                    return;
                }
                if target == self.state.mode {
                    debug!("[{}] switch to {} is a no-op", self.label, target);
                    return;
                }
                if target == AcquisitionMode::Realtime {
                    self.state.retry_count = 0;
                }
                self.transition(target, TransitionReason::Explicit);
            }
            Command::Refresh => {
                if self.state.startup_error.is_some() {
                    warn!("[{}] ignoring refresh: engine did not start", self.label);
                    return;
                }
                self.start_fetch(FetchPurpose::Refresh);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::PollTick { epoch } => {
                if epoch != self.epoch || self.state.mode != AcquisitionMode::Polling {
                    return;
                }
                if !self.signals.is_online {
                    debug!("[{}] offline, skipping poll", self.label);
                    self.observer.on_tick_skipped(SkipReason::Offline);
                    return;
                }
                self.start_fetch(FetchPurpose::Poll);
            }
            Internal::FallbackExpired { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                self.resources.fallback = None;
                if self.state.mode == AcquisitionMode::Realtime && !self.state.is_connected {
                    warn!(
                        "[{}] realtime not connected after {:?}",
                        self.label, self.config.realtime_fallback_timeout
                    );
                    self.record_failure();
                    self.transition(AcquisitionMode::Polling, TransitionReason::FallbackTimeout);
                }
            }
            Internal::QualityCheck => self.quality_check(),
            Internal::ReconnectDue { epoch } => {
                self.resources.reconnect = None;
                if epoch != self.epoch || self.state.mode != AcquisitionMode::Polling {
                    return;
                }
                info!(
                    "[{}] reconnecting realtime (attempt {} of {})",
                    self.label,
                    self.state.retry_count + 1,
                    self.config.max_retries
                );
                self.transition(AcquisitionMode::Realtime, TransitionReason::Recovery);
            }
            Internal::FetchDone {
                epoch,
                version,
                purpose,
                outcome,
            } => self.finish_fetch(epoch, version, purpose, outcome),
        }
    }

    fn handle_transport(&mut self, tagged: TaggedSignal) {
        if !self.adapter.is_current(tagged.tag) || self.state.mode != AcquisitionMode::Realtime {
            debug!("[{}] ignoring signal from retired subscription {}", self.label, tagged.tag);
            return;
        }

        match tagged.signal {
            TransportSignal::Event(event) => self.apply_change(event),
            TransportSignal::Status(TransportStatus::Connecting) => {
                debug!("[{}] realtime connecting", self.label);
            }
            TransportSignal::Status(TransportStatus::Connected) => {
                let latency = self.subscribed_at.map(|at| at.elapsed());
                self.record_success(latency);
                self.state.is_connected = true;
                self.resources.fallback = None;
                if self.reconnect_attempt {
                    self.reconnect_attempt = false;
                    self.state.retry_count = 0;
                }
                info!("[{}] realtime connected on {}", self.label, self.topic);
            }
            TransportSignal::Status(TransportStatus::Error(fault)) => {
                warn!("[{}] realtime transport error: {:?}", self.label, fault);
                self.record_failure();
                if fault.is_terminal() {
                    self.transition(AcquisitionMode::Polling, TransitionReason::TransportFailure);
                } else {
                    self.evaluate_realtime(false);
                }
            }
            TransportSignal::Status(TransportStatus::Closed) => {
                warn!("[{}] realtime channel closed unexpectedly", self.label);
                self.record_failure();
                self.transition(AcquisitionMode::Polling, TransitionReason::TransportFailure);
            }
        }
    }

    fn apply_signals(&mut self, next: SystemSignals) {
        let previous = std::mem::replace(&mut self.signals, next);
        if self.state.startup_error.is_some() {
            return;
        }

        if previous.is_online && !self.signals.is_online {
            warn!("[{}] network went offline", self.label);
            if self.state.mode == AcquisitionMode::Polling {
                self.state.is_connected = false;
            }
            self.notifier.notify(Notification::new(
                NotificationKind::Warning,
                "You are offline",
                "Results will refresh when the connection returns.",
            ));
        }

        if !previous.is_online && self.signals.is_online {
            info!("[{}] network back online", self.label);
            if self.config.enable_smart_reconnect {
                match self.state.mode {
                    AcquisitionMode::Polling => self.start_fetch(FetchPurpose::Poll),
                    AcquisitionMode::Realtime if !self.state.is_connected => self.restart_realtime(),
                    _ => {}
                }
            }
        }

        if self.state.mode == AcquisitionMode::Polling && self.effective_poll_period() != self.poll_period {
            info!(
                "[{}] polling interval {:?} -> {:?}",
                self.label,
                self.poll_period,
                self.effective_poll_period()
            );
            self.arm_polling();
        }
    }

    // --- Quality and recovery ---

    fn quality_check(&mut self) {
        match self.state.mode {
            AcquisitionMode::Realtime => {
                self.evaluate_realtime(true);
                // The first load failed; try again while realtime still holds
                if self.state.mode == AcquisitionMode::Realtime && !self.has_snapshot {
                    self.start_fetch(FetchPurpose::Initial);
                }
            }
            AcquisitionMode::Polling => self.consider_recovery(),
            AcquisitionMode::Static => {}
        }
    }

    fn evaluate_realtime(&mut self, check_score: bool) {
        if let Some(reason) = realtime_downgrade(&self.state, self.quality.quality(), &self.config, check_score) {
            self.transition(AcquisitionMode::Polling, reason);
        }
    }

    fn consider_recovery(&mut self) {
        if !self.config.enable_realtime || !self.config.enable_smart_reconnect {
            return;
        }
        if self.resources.reconnect.is_some() {
            return;
        }
        if self.state.retry_count >= self.config.max_retries {
            debug!("[{}] realtime retry budget exhausted", self.label);
            return;
        }
        if !self.signals.is_online || self.signals.is_slow_connection || self.power_constrained() {
            debug!("[{}] recovery suppressed by host conditions", self.label);
            return;
        }
        if !recovery_gate(&self.state, self.quality.quality(), &self.config, Instant::now()) {
            return;
        }

        let delay = self.config.realtime_retry_delay;
        let epoch = self.epoch;
        info!("[{}] connection healthy, reconnecting realtime in {:?}", self.label, delay);
        self.resources.reconnect = Some(self.after(delay, Internal::ReconnectDue { epoch }));
        self.observer.on_reconnect_scheduled(delay);
    }

    fn record_success(&mut self, response_time: Option<Duration>) {
        self.quality
            .record_sample(true, response_time.map(|d| d.as_secs_f64() * 1000.0));
    }

    fn record_failure(&mut self) {
        self.quality.record_sample(false, None);
        self.state.error_count += 1;
    }

    // --- Data ---

    fn start_fetch(&mut self, purpose: FetchPurpose) {
        let Some(pending) = self.poller.begin(purpose) else {
            if self.poller.in_flight() {
                debug!("[{}] {:?} fetch skipped, previous still in flight", self.label, purpose);
                self.observer.on_tick_skipped(SkipReason::InFlight);
                // The running fetch may have read rows from before this change
                if purpose == FetchPurpose::Resync {
                    self.resync_pending = true;
                }
            }
            return;
        };
        // Anything admitted from here reads rows newer than the pending change
        self.resync_pending = false;

        let epoch = self.epoch;
        let version = self.data_version;
        let tx = self.internal.clone();
        let alive = Arc::clone(&self.alive);
        self.resources.track_fetch(TaskGuard::spawn(async move {
            let outcome = pending.run().await;
            if alive.load(Ordering::Acquire) {
                let _ = tx.send(Internal::FetchDone {
                    epoch,
                    version,
                    purpose,
                    outcome,
                });
            }
        }));
    }

    fn finish_fetch(&mut self, epoch: u64, version: u64, purpose: FetchPurpose, outcome: FetchOutcome) {
        if epoch != self.epoch {
            debug!("[{}] discarding {:?} result from an earlier mode", self.label, purpose);
            self.observer.on_fetch_discarded(DiscardReason::StaleEpoch);
            return;
        }
        self.poller.complete(&outcome);
        self.settle_fetch(version, purpose, outcome);

        if self.resync_pending && self.state.mode == AcquisitionMode::Realtime && !self.poller.in_flight() {
            debug!("[{}] running the resync requested during the last fetch", self.label);
            self.start_fetch(FetchPurpose::Resync);
        }
    }

    fn settle_fetch(&mut self, version: u64, purpose: FetchPurpose, outcome: FetchOutcome) {
        let FetchOutcome {
            tally,
            personal,
            elapsed,
        } = outcome;

        match personal {
            Some(Ok(votes)) => self.user_votes = votes,
            Some(Err(e)) => warn!("[{}] personal vote state unavailable: {}", self.label, e),
            None => {}
        }

        match tally {
            Ok(snapshot) => {
                self.record_success(Some(elapsed));
                if self.state.mode == AcquisitionMode::Polling {
                    self.state.is_connected = true;
                }
                if version != self.data_version {
                    debug!("[{}] {:?} snapshot predates newer updates, discarding", self.label, purpose);
                    self.observer.on_fetch_discarded(DiscardReason::StaleVersion);
                    if purpose == FetchPurpose::Resync && self.resync_retries < MAX_RESYNC_RETRIES {
                        self.resync_retries += 1;
                        self.start_fetch(FetchPurpose::Resync);
                    }
                    return;
                }
                self.resync_retries = 0;
                self.apply_snapshot(snapshot);
            }
            Err(e) => {
                self.record_failure();
                warn!(
                    "[{}] {:?} fetch failed in {} mode ({} errors): {}",
                    self.label, purpose, self.state.mode, self.state.error_count, e
                );
                if self.poller.consecutive_errors() == 1 {
                    self.notifier.notify(Notification::new(
                        NotificationKind::Warning,
                        "Could not refresh results",
                        e.to_string(),
                    ));
                }
                match self.state.mode {
                    AcquisitionMode::Polling => {
                        self.state.is_connected = false;
                        if should_escalate(&self.state, &self.config) {
                            self.transition(AcquisitionMode::Static, TransitionReason::Escalation);
                        }
                    }
                    AcquisitionMode::Realtime => {
                        if purpose == FetchPurpose::Resync {
                            self.resync_pending = true;
                        }
                        self.evaluate_realtime(false);
                    }
                    AcquisitionMode::Static => {}
                }
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: TallySnapshot) {
        // Highlight what moved, but not on the very first load
        let changed: Vec<ItemId> = if self.has_snapshot {
            let previous: HashMap<&ItemId, u64> = self.items.iter().map(|i| (&i.id, i.total)).collect();
            snapshot
                .items
                .iter()
                .filter(|item| previous.get(&item.id) != Some(&item.total))
                .map(|item| item.id.clone())
                .collect()
        } else {
            Vec::new()
        };

        self.items = snapshot.items;
        self.has_snapshot = true;
        self.data_version += 1;
        self.state.last_update = Some(snapshot.fetched_at);
        for id in changed {
            self.highlights.mark_updated(id, self.config.highlight_duration);
        }
    }

    fn apply_change(&mut self, event: ChangeEvent) {
        let point = match (event.kind, event.new_total) {
            (ChangeKind::Updated, Some(total)) => self
                .items
                .iter()
                .position(|item| item.id == event.entity_id)
                .map(|idx| (idx, total)),
            _ => None,
        };
        let Some((idx, total)) = point else {
            debug!(
                "[{}] {:?} event for {} needs a full resync",
                self.label, event.kind, event.entity_id
            );
            self.start_fetch(FetchPurpose::Resync);
            return;
        };

        self.record_success(None);
        let item = &mut self.items[idx];
        if total == item.total {
            debug!("[{}] duplicate update for {}", self.label, event.entity_id);
            return;
        }
        if total < item.total {
            debug!(
                "[{}] out-of-order update for {} ({} < {})",
                self.label, event.entity_id, total, item.total
            );
            return;
        }

        let now = Utc::now();
        item.total = total;
        item.updated_at = Some(now);
        self.data_version += 1;
        self.state.last_update = Some(now);
        self.highlights
            .mark_updated(event.entity_id, self.config.highlight_duration);
    }

    // --- Timers ---

    fn power_constrained(&self) -> bool {
        !self.signals.is_page_visible
            || (self.config.enable_battery_saver && self.signals.battery_low(self.config.low_battery_level))
    }

    fn effective_poll_period(&self) -> Duration {
        if self.power_constrained() {
            self.config.polling_interval * self.config.background_interval_multiplier.max(1)
        } else {
            self.config.polling_interval
        }
    }

    fn arm_polling(&mut self) {
        let period = self.effective_poll_period();
        let epoch = self.epoch;
        self.poll_period = period;
        self.resources.polling = Some(self.every(period, move || Internal::PollTick { epoch }));
    }

    fn after(&self, delay: Duration, message: Internal) -> TaskGuard {
        let tx = self.internal.clone();
        let alive = Arc::clone(&self.alive);
        TaskGuard::spawn(async move {
            tokio::time::sleep(delay).await;
            if alive.load(Ordering::Acquire) {
                let _ = tx.send(message);
            }
        })
    }

    fn every<F>(&self, period: Duration, make: F) -> TaskGuard
    where
        F: Fn() -> Internal + Send + 'static,
    {
        let tx = self.internal.clone();
        let alive = Arc::clone(&self.alive);
        TaskGuard::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !alive.load(Ordering::Acquire) || tx.send(make()).is_err() {
                    break;
                }
            }
        })
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            vote_id: self.vote_id.clone(),
            state: self.state.clone(),
            quality: self.quality.quality().clone(),
            signals: self.signals.clone(),
            items: self.items.clone(),
            user_votes: self.user_votes.clone(),
            polling: PollingStats {
                last_success: self.poller.last_success(),
                consecutive_errors: self.poller.consecutive_errors(),
            },
            data_version: self.data_version,
            resources: ResourceCounts {
                timers: self.resources.live_timers(),
                subscriptions: usize::from(self.adapter.is_subscribed()),
                highlight_timers: self.highlights.pending_timers(),
                fetches_in_flight: self.resources.live_fetches(),
                polling_active: self.resources.polling_active(),
            },
        }
    }
}

async fn next_signals(rx: &mut Option<watch::Receiver<SystemSignals>>) -> Option<SystemSignals> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

fn mode_notice(from: AcquisitionMode, to: AcquisitionMode, reason: TransitionReason) -> Notification {
    let kind = match (to, reason) {
        (AcquisitionMode::Static, _) => NotificationKind::Error,
        (_, TransitionReason::Explicit) => NotificationKind::Info,
        (AcquisitionMode::Realtime, _) => NotificationKind::Success,
        _ => NotificationKind::Warning,
    };
    let title = match to {
        AcquisitionMode::Realtime => "Live updates on",
        AcquisitionMode::Polling => "Switched to periodic refresh",
        AcquisitionMode::Static => "Live updates paused",
    };
    Notification::new(kind, title, format!("{} -> {}: {}", from, to, reason))
}
