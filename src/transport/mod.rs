pub mod local;

use crate::error::TransportError;
use crate::models::{ChangeEvent, VoteId};
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Topic key used for a vote's change feed.
pub fn topic_for(vote_id: &VoteId) -> String {
    format!("vote_results:{}", vote_id)
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportFault {
    ChannelError(String),
    TimedOut,
    Delivery(String),
}

impl TransportFault {
    /// Terminal faults end the subscription; delivery faults are transient.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransportFault::Delivery(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Error(TransportFault),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Event(ChangeEvent),
    Status(TransportStatus),
}

/// A signal stamped with the subscription that produced it.
#[derive(Debug, Clone)]
pub struct TaggedSignal {
    pub tag: u64,
    pub signal: TransportSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub Uuid);

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a transport delivers events and status changes for one subscription.
#[derive(Debug, Clone)]
pub struct TransportSink {
    tag: u64,
    tx: mpsc::UnboundedSender<TaggedSignal>,
}

impl TransportSink {
    pub fn new(tag: u64, tx: mpsc::UnboundedSender<TaggedSignal>) -> Self {
        Self { tag, tx }
    }

    /// Returns false once the consumer is gone.
    pub fn event(&self, event: ChangeEvent) -> bool {
        self.send(TransportSignal::Event(event))
    }

    pub fn status(&self, status: TransportStatus) -> bool {
        self.send(TransportSignal::Status(status))
    }

    fn send(&self, signal: TransportSignal) -> bool {
        self.tx
            .send(TaggedSignal {
                tag: self.tag,
                signal,
            })
            .is_ok()
    }
}

/// Opaque push change-feed. Implementations must never call back into the
/// caller synchronously; everything goes through the sink.
pub trait PushTransport: Send + Sync {
    fn subscribe(&self, topic: &str, sink: TransportSink) -> Result<SubscriptionHandle, TransportError>;
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

struct ActiveSubscription {
    topic: String,
    handle: SubscriptionHandle,
    tag: u64,
}

pub struct RealtimeSubscriptionAdapter {
    transport: Arc<dyn PushTransport>,
    signals: mpsc::UnboundedSender<TaggedSignal>,
    active: Option<ActiveSubscription>,
    next_tag: u64,
}

impl RealtimeSubscriptionAdapter {
    pub fn new(transport: Arc<dyn PushTransport>, signals: mpsc::UnboundedSender<TaggedSignal>) -> Self {
        Self {
            transport,
            signals,
            active: None,
            next_tag: 0,
        }
    }

    /// Idempotent per topic. A different topic replaces the current subscription.
    pub fn subscribe(&mut self, topic: &str) -> Result<u64, TransportError> {
        if let Some(active) = &self.active {
            if active.topic == topic {
                debug!("already subscribed to {}", topic);
                return Ok(active.tag);
            }
            self.unsubscribe();
        }

        self.next_tag += 1;
        let tag = self.next_tag;
        let sink = TransportSink::new(tag, self.signals.clone());
        let handle = self.transport.subscribe(topic, sink)?;
        info!("subscribed to {} (tag {})", topic, tag);
        self.active = Some(ActiveSubscription {
            topic: topic.to_string(),
            handle,
            tag,
        });
        Ok(tag)
    }

    pub fn unsubscribe(&mut self) {
        if let Some(active) = self.active.take() {
            info!("unsubscribing from {} (tag {})", active.topic, active.tag);
            self.transport.unsubscribe(active.handle);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.active.is_some()
    }

    /// Signals from retired subscriptions carry an old tag and must be ignored.
    pub fn is_current(&self, tag: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.tag == tag)
    }

    pub fn topic(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.topic.as_str())
    }
}

impl Drop for RealtimeSubscriptionAdapter {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingTransport {
        subscribed: Mutex<Vec<String>>,
        unsubscribed: Mutex<usize>,
    }

    impl PushTransport for CountingTransport {
        fn subscribe(&self, topic: &str, sink: TransportSink) -> Result<SubscriptionHandle, TransportError> {
            self.subscribed.lock().unwrap().push(topic.to_string());
            sink.status(TransportStatus::Connecting);
            Ok(SubscriptionHandle::new())
        }

        fn unsubscribe(&self, _handle: SubscriptionHandle) {
            *self.unsubscribed.lock().unwrap() += 1;
        }
    }

    #[test]
    fn subscribe_is_idempotent_per_topic() {
        let transport = Arc::new(CountingTransport::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut adapter = RealtimeSubscriptionAdapter::new(transport.clone(), tx);

        let first = adapter.subscribe("vote_results:1").unwrap();
        let again = adapter.subscribe("vote_results:1").unwrap();
        assert_eq!(first, again);
        assert_eq!(transport.subscribed.lock().unwrap().len(), 1);

        let other = adapter.subscribe("vote_results:2").unwrap();
        assert_ne!(first, other);
        assert_eq!(*transport.unsubscribed.lock().unwrap(), 1);
        assert!(!adapter.is_current(first));
        assert!(adapter.is_current(other));

        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.tag, first);
        assert_eq!(signal.signal, TransportSignal::Status(TransportStatus::Connecting));

        drop(adapter);
        assert_eq!(*transport.unsubscribed.lock().unwrap(), 2);
    }

    #[test]
    fn only_delivery_faults_are_transient() {
        assert!(TransportFault::TimedOut.is_terminal());
        assert!(TransportFault::ChannelError("reset".into()).is_terminal());
        assert!(!TransportFault::Delivery("lagged".into()).is_terminal());
        assert_eq!(topic_for(&VoteId::Int(9)), "vote_results:9");
    }
}
