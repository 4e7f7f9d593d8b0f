use crate::downloads::record::DownloadRecord;
use tokio::sync::broadcast;

/// Snapshots buffered per subscriber before it starts lagging
const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of download snapshots to any interested observer.
///
/// Delivery is best-effort: publishing never blocks and never fails the
/// caller. A slow subscriber skips ahead rather than holding up a transfer.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<DownloadRecord>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Push a snapshot to all current subscribers
    pub fn publish(&self, snapshot: DownloadRecord) {
        let id = snapshot.id.clone();
        if let Err(e) = self.tx.send(snapshot) {
            tracing::debug!(id = %id, "No progress subscribers: {e}");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadRecord> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
