//! Live build progress fan-out.
//!
//! Each app gets a `tokio::sync::broadcast` channel created on demand.
//! Producers never wait on consumers: when a subscriber falls more than the
//! channel capacity behind, the oldest events it has not read are dropped and
//! the subscriber observes a lag. The build log file is the complete record.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Message {
        text: String,
    },
    Error {
        text: String,
    },
    Complete {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildProgress {
    pub app_id: String,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

impl BuildProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(self.event, ProgressEvent::Complete { .. })
    }
}

/// Handle for publishing one app's progress events.
#[derive(Clone)]
pub struct ProgressSender {
    app_id: String,
    tx: broadcast::Sender<BuildProgress>,
}

impl ProgressSender {
    pub fn send(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.tx.send(BuildProgress {
            app_id: self.app_id.clone(),
            event,
        });
    }

    pub fn message(&self, text: impl Into<String>) {
        self.send(ProgressEvent::Message { text: text.into() });
    }
}

pub struct ProgressHub {
    channels: DashMap<String, broadcast::Sender<BuildProgress>>,
    capacity: usize,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn channel(&self, app_id: &str) -> broadcast::Sender<BuildProgress> {
        self.channels
            .entry(app_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn sender(&self, app_id: &str) -> ProgressSender {
        ProgressSender {
            app_id: app_id.to_string(),
            tx: self.channel(app_id),
        }
    }

    pub fn subscribe(&self, app_id: &str) -> broadcast::Receiver<BuildProgress> {
        self.channel(app_id).subscribe()
    }

    pub fn remove(&self, app_id: &str) {
        self.channels.remove(app_id);
    }
}
