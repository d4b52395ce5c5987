use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Payload of a `notify.show` message to the host UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub level: NotifyLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct NotifyShow<'a> {
    pub kind: &'static str,
    pub payload: &'a Notification,
}

impl Notification {
    pub fn as_message(&self) -> NotifyShow<'_> {
        NotifyShow {
            kind: "notify.show",
            payload: self,
        }
    }
}

/// Fan-out to UI subscribers. Identical notifications within the coalesce
/// window are emitted once.
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
    coalesce: Duration,
    enabled: bool,
    last_sent: HashMap<(NotifyLevel, String), DateTime<Utc>>,
}

impl Notifier {
    pub fn new(tx: broadcast::Sender<Notification>, coalesce: Duration) -> Self {
        Self {
            tx,
            coalesce,
            enabled: true,
            last_sent: HashMap::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Returns whether the notification was fanned out.
    pub fn emit(&mut self, level: NotifyLevel, message: impl Into<String>, now: DateTime<Utc>) -> bool {
        let message = message.into();
        if !self.enabled {
            debug!(target = "ingest.notify", ?level, %message, "notification_suppressed");
            return false;
        }
        let window = self.coalesce;
        self.last_sent.retain(|_, at| now - *at < window);
        let key = (level, message);
        if self.last_sent.contains_key(&key) {
            debug!(target = "ingest.notify", ?level, message = %key.1, "notification_coalesced");
            return false;
        }
        let notification = Notification {
            level,
            message: key.1.clone(),
            at: now,
        };
        self.last_sent.insert(key, now);
        // No subscribers is fine; history still records the outcome.
        let _ = self.tx.send(notification);
        true
    }
}
