use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Transfer status carried by a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pulling,
    AlreadyExists,
    Downloading,
    DownloadComplete,
    Copying,
    Done,
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProgressStatus::Pulling => "Pulling",
            ProgressStatus::AlreadyExists => "Already exists",
            ProgressStatus::Downloading => "Downloading",
            ProgressStatus::DownloadComplete => "Download complete",
            ProgressStatus::Copying => "Copying",
            ProgressStatus::Done => "Done",
        };
        write!(f, "{}", s)
    }
}

/// Progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Image name or short blob digest
    pub id: String,

    pub status: ProgressStatus,

    /// Bytes transferred so far, when known
    pub current: Option<u64>,

    /// Total bytes, when known
    pub total: Option<u64>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ProgressEvent {
    pub fn new(id: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            id: id.into(),
            status,
            current: None,
            total: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_bytes(mut self, current: u64, total: Option<u64>) -> Self {
        self.current = Some(current);
        self.total = total;
        self
    }
}

/// Progress emitter. Emission never fails, whether or not anyone listens.
#[derive(Clone)]
pub struct ProgressEmitter {
    sender: Arc<broadcast::Sender<ProgressEvent>>,
}

impl ProgressEmitter {
    /// Create a new progress emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    /// Shorthand for emitting a status without byte counts
    pub fn status(&self, id: impl Into<String>, status: ProgressStatus) {
        self.emit(ProgressEvent::new(id, status));
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = ProgressEmitter::new(4);
        emitter.status("nginx", ProgressStatus::Pulling);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let emitter = ProgressEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(ProgressEvent::new("sha256:abc", ProgressStatus::Downloading).with_bytes(10, Some(100)));
        emitter.status("sha256:abc", ProgressStatus::DownloadComplete);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, ProgressStatus::Downloading);
        assert_eq!(first.current, Some(10));
        assert_eq!(first.total, Some(100));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, ProgressStatus::DownloadComplete);
        assert!(second.current.is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ProgressStatus::AlreadyExists.to_string(), "Already exists");
        assert_eq!(ProgressStatus::DownloadComplete.to_string(), "Download complete");
    }
}
