//! Typed lifecycle events relayed to the host UI.
//!
//! Events are published on a broadcast channel. Each subscriber sees them
//! in emission order, at most once; a subscriber that falls more than
//! [`EVENT_CAPACITY`] events behind loses the oldest ones.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::download::DownloadProgress;
use crate::error::{ErrorKind, UpdateError};

/// Buffered events per subscriber.
pub const EVENT_CAPACITY: usize = 64;

/// One pipeline lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum UpdateEvent {
    Checking,
    UpToDate,
    UpdateAvailable {
        version: String,
    },
    #[serde(rename_all = "camelCase")]
    DownloadProgress {
        bytes_per_second: u64,
        percent: Option<f64>,
        transferred: u64,
        total: Option<u64>,
    },
    UpdateDownloaded {
        version: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl UpdateEvent {
    pub fn error(err: &UpdateError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<DownloadProgress> for UpdateEvent {
    fn from(p: DownloadProgress) -> Self {
        Self::DownloadProgress {
            bytes_per_second: p.bytes_per_second,
            percent: p.percentage(),
            transferred: p.downloaded,
            total: p.total,
        }
    }
}

/// Publisher side of the event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UpdateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: UpdateEvent) {
        trace!(?event, "Emitting update event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(UpdateEvent::Checking);
        bus.emit(UpdateEvent::UpdateAvailable { version: "2.0.0".to_string() });
        bus.emit(UpdateEvent::UpdateDownloaded { version: "2.0.0".to_string() });

        assert_eq!(rx.recv().await.unwrap(), UpdateEvent::Checking);
        assert_eq!(
            rx.recv().await.unwrap(),
            UpdateEvent::UpdateAvailable { version: "2.0.0".to_string() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            UpdateEvent::UpdateDownloaded { version: "2.0.0".to_string() }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new().emit(UpdateEvent::UpToDate);
    }

    #[test]
    fn test_event_json_shape() {
        let progress = DownloadProgress::new(512, Some(1024), Duration::from_secs(2));
        let json = serde_json::to_value(UpdateEvent::from(progress)).unwrap();
        assert_eq!(json["event"], "download-progress");
        assert_eq!(json["bytesPerSecond"], 256);
        assert_eq!(json["percent"], 50.0);

        let err = UpdateError::ManifestParse("missing `version`".to_string());
        let json = serde_json::to_value(UpdateEvent::error(&err)).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["kind"], "manifest-parse");
    }
}
