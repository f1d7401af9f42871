use log::{error, info, warn};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing message; rendering belongs to the UI collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub duration: Duration,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        let duration = match kind {
            NotificationKind::Error => Duration::from_secs(8),
            NotificationKind::Warning => Duration::from_secs(5),
            _ => Duration::from_secs(3),
        };
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            duration,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log instead of a UI toast.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, n: Notification) {
        match n.kind {
            NotificationKind::Error => error!("{}: {}", n.title, n.message),
            NotificationKind::Warning => warn!("{}: {}", n.title, n.message),
            NotificationKind::Info | NotificationKind::Success => info!("{}: {}", n.title, n.message),
        }
    }
}
