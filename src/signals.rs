//! Host signal monitoring: network reachability, connection class, battery
//! and page visibility. Platform glue pushes raw [`SignalEvent`]s in; the
//! monitor re-samples its [`SignalProbe`] once a burst has settled and
//! publishes the result on a `watch` channel.

use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    Slow2g,
    Cellular2g,
    Cellular3g,
    Cellular4g,
    Wifi,
    Ethernet,
    Other,
}

impl ConnectionType {
    pub fn is_slow(self) -> bool {
        matches!(self, ConnectionType::Slow2g | ConnectionType::Cellular2g)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatteryStatus {
    pub is_charging: Option<bool>,
    pub level: Option<f64>,
    pub charging_time: Option<f64>,
    pub discharging_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSignals {
    pub is_online: bool,
    pub is_slow_connection: bool,
    pub connection_type: Option<ConnectionType>,
    pub is_page_visible: bool,
    pub battery: BatteryStatus,
}

impl Default for SystemSignals {
    fn default() -> Self {
        Self {
            is_online: true,
            is_slow_connection: false,
            connection_type: None,
            is_page_visible: true,
            battery: BatteryStatus::default(),
        }
    }
}

impl SystemSignals {
    /// True when the battery reports discharging at or below `threshold`.
    pub fn battery_low(&self, threshold: f64) -> bool {
        self.battery.is_charging == Some(false)
            && self.battery.level.is_some_and(|level| level <= threshold)
    }
}

#[derive(Debug, Error)]
#[error("signal probe unavailable: {0}")]
pub struct ProbeError(pub String);

/// Platform access. Every method may fail or report "unsupported" (`None`).
pub trait SignalProbe: Send + Sync {
    fn online(&self) -> Result<bool, ProbeError>;
    fn connection_type(&self) -> Result<Option<ConnectionType>, ProbeError>;
    fn page_visible(&self) -> Result<bool, ProbeError>;
    fn battery(&self) -> Result<Option<BatteryStatus>, ProbeError>;
}

/// Probe for hosts without any platform signal support.
pub struct NeutralProbe;

impl SignalProbe for NeutralProbe {
    fn online(&self) -> Result<bool, ProbeError> {
        Ok(true)
    }
    fn connection_type(&self) -> Result<Option<ConnectionType>, ProbeError> {
        Ok(None)
    }
    fn page_visible(&self) -> Result<bool, ProbeError> {
        Ok(true)
    }
    fn battery(&self) -> Result<Option<BatteryStatus>, ProbeError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Online,
    Offline,
    ConnectionChanged,
    VisibilityChanged,
    BatteryChanged,
}

/// Reads every probe, replacing failures with neutral defaults.
pub fn sample(probe: &dyn SignalProbe) -> SystemSignals {
    let is_online = probe.online().unwrap_or_else(|e| {
        debug!("online probe failed, assuming online: {}", e);
        true
    });
    let connection_type = probe.connection_type().unwrap_or_else(|e| {
        debug!("connection probe failed: {}", e);
        None
    });
    let is_page_visible = probe.page_visible().unwrap_or_else(|e| {
        debug!("visibility probe failed, assuming visible: {}", e);
        true
    });
    let battery = match probe.battery() {
        Ok(Some(status)) => status,
        Ok(None) => BatteryStatus::default(),
        Err(e) => {
            debug!("battery probe failed: {}", e);
            BatteryStatus::default()
        }
    };

    SystemSignals {
        is_online,
        is_slow_connection: connection_type.is_some_and(ConnectionType::is_slow),
        connection_type,
        is_page_visible,
        battery,
    }
}

pub struct SystemSignalMonitor {
    events: mpsc::UnboundedSender<SignalEvent>,
    state: watch::Receiver<SystemSignals>,
    task: JoinHandle<()>,
}

impl SystemSignalMonitor {
    /// Samples once immediately, then re-samples after each debounced burst.
    pub fn spawn(probe: Arc<dyn SignalProbe>, debounce: Duration) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(sample(probe.as_ref()));

        let task = tokio::spawn(async move {
            while let Some(first) = events_rx.recv().await {
                let mut burst = 1usize;
                let mut last = first;
                // Trailing debounce: wait until the burst goes quiet
                loop {
                    match tokio::time::timeout(debounce, events_rx.recv()).await {
                        Ok(Some(event)) => {
                            burst += 1;
                            last = event;
                        }
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                let next = sample(probe.as_ref());
                let changed = state_tx.send_if_modified(|current| {
                    if *current == next {
                        false
                    } else {
                        *current = next.clone();
                        true
                    }
                });
                if changed {
                    info!(
                        "system signals changed after {} event(s) (last {:?}): online={} slow={} visible={}",
                        burst, last, next.is_online, next.is_slow_connection, next.is_page_visible
                    );
                }
            }
        });

        Self {
            events: events_tx,
            state: state_rx,
            task,
        }
    }

    pub fn push(&self, event: SignalEvent) {
        let _ = self.events.send(event);
    }

    pub fn current(&self) -> SystemSignals {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemSignals> {
        self.state.clone()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for SystemSignalMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
