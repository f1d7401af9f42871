#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use live_tally::config::EngineConfig;
use live_tally::engine::{
    AcquisitionMode, DiscardReason, EngineBuilder, EngineHandle, EngineObserver, EngineSnapshot, SkipReason,
    TransitionReason,
};
use live_tally::error::{FetchError, TransportError};
use live_tally::models::{ChangeEvent, EntityId, UserId, UserVoteRecord, VoteId, VoteTallyItem};
use live_tally::notify::{Notification, NotificationKind, NotificationSink};
use live_tally::polling::TallySource;
use live_tally::signals::SystemSignals;
use live_tally::transport::{
    PushTransport, SubscriptionHandle, TransportFault, TransportSink, TransportStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

pub const VOTE: i64 = 1;

pub fn item(id: i64, total: u64) -> VoteTallyItem {
    VoteTallyItem::new(id, VOTE, format!("subject-{}", id), total)
}

/// Lets every ready task run. Under a paused clock the runtime only
/// advances time once nothing else can make progress.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// --- Tally source ---

pub struct ScriptedSource {
    items: Mutex<Vec<VoteTallyItem>>,
    fail_tally: AtomicBool,
    fail_personal: AtomicBool,
    tally_calls: AtomicUsize,
    personal_calls: AtomicUsize,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ScriptedSource {
    pub fn new(items: Vec<VoteTallyItem>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
            fail_tally: AtomicBool::new(false),
            fail_personal: AtomicBool::new(false),
            tally_calls: AtomicUsize::new(0),
            personal_calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        })
    }

    pub fn set_items(&self, items: Vec<VoteTallyItem>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn fail_tally(&self, fail: bool) {
        self.fail_tally.store(fail, Ordering::SeqCst);
    }

    pub fn fail_personal(&self, fail: bool) {
        self.fail_personal.store(fail, Ordering::SeqCst);
    }

    pub fn tally_calls(&self) -> usize {
        self.tally_calls.load(Ordering::SeqCst)
    }

    pub fn personal_calls(&self) -> usize {
        self.personal_calls.load(Ordering::SeqCst)
    }

    /// The next tally fetch reads its rows immediately but does not return
    /// until the sender fires (or is dropped).
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl TallySource for ScriptedSource {
    async fn fetch_tally_snapshot(&self, _vote_id: &VoteId) -> Result<Vec<VoteTallyItem>, FetchError> {
        self.tally_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_tally.load(Ordering::SeqCst) {
            Err(FetchError::Unavailable("tally store down".into()))
        } else {
            Ok(self.items.lock().unwrap().clone())
        };
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        result
    }

    async fn fetch_user_vote_state(
        &self,
        _vote_id: &VoteId,
        _user_id: &UserId,
    ) -> Result<Vec<UserVoteRecord>, FetchError> {
        self.personal_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_personal.load(Ordering::SeqCst) {
            return Err(FetchError::Unavailable("personal store down".into()));
        }
        Ok(vec![UserVoteRecord {
            item_id: EntityId::Int(1),
            amount: 2,
            created_at: Utc::now(),
        }])
    }
}

// --- Push transport ---

#[derive(Default)]
pub struct MockTransport {
    active: Mutex<HashMap<SubscriptionHandle, TransportSink>>,
    history: Mutex<Vec<TransportSink>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    auto_connect: AtomicBool,
    reject: AtomicBool,
}

impl MockTransport {
    pub fn new(auto_connect: bool) -> Arc<Self> {
        let transport = Self::default();
        transport.auto_connect.store(auto_connect, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn set_auto_connect(&self, on: bool) {
        self.auto_connect.store(on, Ordering::SeqCst);
    }

    pub fn set_reject(&self, on: bool) {
        self.reject.store(on, Ordering::SeqCst);
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    fn latest(&self) -> Option<TransportSink> {
        self.history.lock().unwrap().last().cloned()
    }

    pub fn emit_event(&self, event: ChangeEvent) {
        if let Some(sink) = self.latest() {
            sink.event(event);
        }
    }

    pub fn emit_status(&self, status: TransportStatus) {
        if let Some(sink) = self.latest() {
            sink.status(status);
        }
    }

    pub fn emit_fault(&self, fault: TransportFault) {
        self.emit_status(TransportStatus::Error(fault));
    }

    /// Sends through the first sink ever handed out, long retired in most tests.
    pub fn emit_on_first(&self, event: ChangeEvent) {
        if let Some(sink) = self.history.lock().unwrap().first() {
            sink.event(event);
        }
    }
}

impl PushTransport for MockTransport {
    fn subscribe(&self, topic: &str, sink: TransportSink) -> Result<SubscriptionHandle, TransportError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                topic: topic.to_string(),
                reason: "scripted rejection".into(),
            });
        }
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        sink.status(TransportStatus::Connecting);
        if self.auto_connect.load(Ordering::SeqCst) {
            sink.status(TransportStatus::Connected);
        }
        let handle = SubscriptionHandle::new();
        self.active.lock().unwrap().insert(handle, sink.clone());
        self.history.lock().unwrap().push(sink);
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.active.lock().unwrap().remove(&handle);
    }
}

// --- Observer and notifier ---

#[derive(Default)]
pub struct RecordingObserver {
    pub transitions: Mutex<Vec<(AcquisitionMode, AcquisitionMode, TransitionReason)>>,
    pub discards: Mutex<Vec<DiscardReason>>,
    pub skips: Mutex<Vec<SkipReason>>,
    pub reconnects: Mutex<Vec<Instant>>,
}

impl RecordingObserver {
    pub fn transitions(&self) -> Vec<(AcquisitionMode, AcquisitionMode, TransitionReason)> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn discards(&self) -> Vec<DiscardReason> {
        self.discards.lock().unwrap().clone()
    }

    pub fn skips(&self) -> Vec<SkipReason> {
        self.skips.lock().unwrap().clone()
    }

    pub fn reconnects(&self) -> Vec<Instant> {
        self.reconnects.lock().unwrap().clone()
    }
}

impl EngineObserver for RecordingObserver {
    fn on_transition(&self, from: AcquisitionMode, to: AcquisitionMode, reason: TransitionReason) {
        self.transitions.lock().unwrap().push((from, to, reason));
    }

    fn on_fetch_discarded(&self, reason: DiscardReason) {
        self.discards.lock().unwrap().push(reason);
    }

    fn on_tick_skipped(&self, reason: SkipReason) {
        self.skips.lock().unwrap().push(reason);
    }

    fn on_reconnect_scheduled(&self, _delay: Duration) {
        self.reconnects.lock().unwrap().push(Instant::now());
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.seen.lock().unwrap().iter().map(|n| n.kind).collect()
    }

    pub fn titles(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|n| n.title.clone()).collect()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

// --- Harness ---

pub struct Harness {
    pub engine: EngineHandle,
    pub source: Arc<ScriptedSource>,
    pub transport: Arc<MockTransport>,
    pub observer: Arc<RecordingObserver>,
    pub notifier: Arc<RecordingNotifier>,
    pub signals: watch::Sender<SystemSignals>,
}

impl Harness {
    pub fn start(config: EngineConfig, items: Vec<VoteTallyItem>, auto_connect: bool) -> Self {
        Self::start_for(VoteId::Int(VOTE), config, items, auto_connect)
    }

    pub fn start_for(vote_id: VoteId, config: EngineConfig, items: Vec<VoteTallyItem>, auto_connect: bool) -> Self {
        let source = ScriptedSource::new(items);
        let transport = MockTransport::new(auto_connect);
        let observer = Arc::new(RecordingObserver::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let (signals, signals_rx) = watch::channel(SystemSignals::default());

        let engine = EngineBuilder::new(vote_id, source.clone(), transport.clone())
            .user(Some(UserId::from("fan-1")))
            .config(config)
            .notifier(notifier.clone())
            .observer(observer.clone())
            .signals(signals_rx)
            .spawn();

        Self {
            engine,
            source,
            transport,
            observer,
            notifier,
            signals,
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.engine.snapshot()
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.engine.mode()
    }

    pub fn total_of(&self, id: i64) -> Option<u64> {
        self.snapshot()
            .items
            .iter()
            .find(|i| i.id == EntityId::Int(id))
            .map(|i| i.total)
    }

    pub fn set_signals(&self, update: impl FnOnce(&mut SystemSignals)) {
        self.signals.send_modify(update);
    }
}

/// At most one acquisition mechanism may be live for the current mode.
pub fn assert_exclusive(snapshot: &EngineSnapshot) {
    let r = &snapshot.resources;
    match snapshot.state.mode {
        AcquisitionMode::Realtime => {
            assert_eq!(r.subscriptions, 1, "realtime needs its subscription");
            assert!(!r.polling_active, "no polling timer in realtime");
        }
        AcquisitionMode::Polling => {
            assert_eq!(r.subscriptions, 0, "no subscription while polling");
            assert!(r.polling_active, "polling timer must run");
        }
        AcquisitionMode::Static => {
            assert_eq!(r.subscriptions, 0, "no subscription in static");
            assert!(!r.polling_active, "no polling timer in static");
        }
    }
}

pub fn default_items() -> Vec<VoteTallyItem> {
    vec![item(1, 5), item(2, 3)]
}
