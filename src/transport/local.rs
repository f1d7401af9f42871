//! In-process change feed. Producers publish row changes per topic and every
//! subscriber gets its own forwarding task fed from a broadcast channel.

use super::{PushTransport, SubscriptionHandle, TransportFault, TransportSink, TransportStatus};
use crate::error::TransportError;
use crate::models::ChangeEvent;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

const DEFAULT_CAPACITY: usize = 256;

struct FeedInner {
    capacity: usize,
    topics: HashMap<String, broadcast::Sender<ChangeEvent>>,
    subscriptions: HashMap<SubscriptionHandle, JoinHandle<()>>,
}

#[derive(Clone)]
pub struct LocalChangeFeed {
    inner: Arc<Mutex<FeedInner>>,
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                capacity: capacity.max(1),
                topics: HashMap::new(),
                subscriptions: HashMap::new(),
            })),
        }
    }

    /// Returns the number of live receivers the event reached.
    pub fn publish(&self, topic: &str, event: ChangeEvent) -> usize {
        let sender = {
            let inner = self.lock();
            inner.topics.get(topic).cloned()
        };
        match sender {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => {
                debug!("no subscribers for {}, dropping {:?}", topic, event.kind);
                0
            }
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        let mut inner = self.lock();
        inner.subscriptions.retain(|_, task| !task.is_finished());
        inner.subscriptions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FeedInner> {
        // A poisoned feed only holds channel handles; keep serving
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PushTransport for LocalChangeFeed {
    fn subscribe(&self, topic: &str, sink: TransportSink) -> Result<SubscriptionHandle, TransportError> {
        let mut inner = self.lock();
        let capacity = inner.capacity;
        let mut rx = inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();

        let handle = SubscriptionHandle::new();
        let topic_name = topic.to_string();
        sink.status(TransportStatus::Connecting);

        let task = tokio::spawn(async move {
            if !sink.status(TransportStatus::Connected) {
                return;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !sink.event(event) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("subscriber on {} lagged, {} event(s) skipped", topic_name, skipped);
                        let fault = TransportFault::Delivery(format!("{} events skipped", skipped));
                        if !sink.status(TransportStatus::Error(fault)) {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        sink.status(TransportStatus::Closed);
                        break;
                    }
                }
            }
        });

        inner.subscriptions.insert(handle, task);
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(task) = self.lock().subscriptions.remove(&handle) {
            task.abort();
        }
    }
}
