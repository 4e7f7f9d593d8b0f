//! In-memory store of download records.
//!
//! Shared between request handlers and transfer workers. Structural changes and
//! per-record updates both go through one `RwLock`; every read hands out a
//! cloned snapshot.

use crate::downloads::record::{DownloadRecord, DownloadStatus};
use crate::error::TransferError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed(TransferError),
}

struct Entry {
    record: DownloadRecord,
    cancel: CancellationToken,
    publishing: bool,
}

#[derive(Default)]
pub struct DownloadRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl DownloadRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new `pending` record under a fresh id
    pub fn create(
        &self,
        owner: &str,
        source_url: &str,
        category: &str,
        filename: &str,
        destination_path: PathBuf,
    ) -> DownloadRecord {
        let record = new_record(owner, source_url, category, filename, destination_path);
        Self::insert(&mut self.entries.write(), record.clone());
        record
    }

    /// Like [`create`](Self::create), unless a pending or running download
    /// already targets the same destination. That download is returned instead.
    pub fn create_exclusive(
        &self,
        owner: &str,
        source_url: &str,
        category: &str,
        filename: &str,
        destination_path: PathBuf,
    ) -> Result<DownloadRecord, DownloadRecord> {
        let mut entries = self.entries.write();
        if let Some(active) = entries.values().find(|e| {
            !e.record.status.is_terminal() && e.record.destination_path == destination_path
        }) {
            return Err(active.record.clone());
        }

        let record = new_record(owner, source_url, category, filename, destination_path);
        Self::insert(&mut entries, record.clone());
        Ok(record)
    }

    fn insert(entries: &mut HashMap<String, Entry>, record: DownloadRecord) {
        entries.insert(
            record.id.clone(),
            Entry {
                record,
                cancel: CancellationToken::new(),
                publishing: false,
            },
        );
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<DownloadRecord> {
        self.entries.read().get(id).map(|e| e.record.clone())
    }

    /// All records, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<DownloadRecord> {
        let mut records: Vec<DownloadRecord> = self
            .entries
            .read()
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask a running transfer to stop.
    ///
    /// Returns true only if the flag was newly set. Pending, finished,
    /// publishing and unknown downloads report false.
    pub fn request_cancel(&self, id: &str) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };

        if entry.record.status != DownloadStatus::Downloading
            || entry.record.cancel_requested
            || entry.publishing
        {
            return false;
        }

        entry.record.cancel_requested = true;
        entry.cancel.cancel();
        true
    }

    /// Token the worker watches for cancellation
    #[must_use]
    pub fn cancel_token(&self, id: &str) -> Option<CancellationToken> {
        self.entries.read().get(id).map(|e| e.cancel.clone())
    }

    /// Move a record from `pending` to `downloading`.
    ///
    /// Only one caller can win this per id, which is what keeps a download to a
    /// single worker.
    pub fn begin(&self, id: &str) -> Option<DownloadRecord> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(id)?;
        if entry.record.status != DownloadStatus::Pending {
            return None;
        }
        entry.record.status = DownloadStatus::Downloading;
        Some(entry.record.clone())
    }

    /// Apply a worker update to a live record and return the new snapshot.
    /// Terminal records are left untouched.
    pub fn update<F>(&self, id: &str, f: F) -> Option<DownloadRecord>
    where
        F: FnOnce(&mut DownloadRecord),
    {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(id)?;
        if entry.record.status.is_terminal() {
            return None;
        }
        f(&mut entry.record);
        Some(entry.record.clone())
    }

    /// Commit to publishing. Fails if cancellation was already requested;
    /// afterwards cancellation requests are refused.
    pub fn begin_publish(&self, id: &str) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if entry.record.cancel_requested || entry.record.status != DownloadStatus::Downloading {
            return false;
        }
        entry.publishing = true;
        true
    }

    /// Move a record to its terminal state. Already-terminal records never change.
    pub fn finish(&self, id: &str, outcome: &Outcome) -> Option<DownloadRecord> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(id)?;
        let record = &mut entry.record;
        if record.status.is_terminal() {
            return None;
        }

        match outcome {
            Outcome::Completed => {
                record.status = DownloadStatus::Completed;
                if record.bytes_total == 0 {
                    record.bytes_total = record.bytes_transferred;
                }
                record.bytes_transferred = record.bytes_total;
                record.percent_complete = 100.0;
            }
            Outcome::Cancelled => record.status = DownloadStatus::Cancelled,
            Outcome::Failed(err) => {
                record.status = DownloadStatus::Failed;
                record.error_message = Some(err.to_string());
                record.failure = Some(err.kind());
            }
        }
        record.completed_at = Some(chrono::Utc::now().to_rfc3339());
        entry.publishing = false;

        Some(record.clone())
    }
}

fn new_record(
    owner: &str,
    source_url: &str,
    category: &str,
    filename: &str,
    destination_path: PathBuf,
) -> DownloadRecord {
    DownloadRecord {
        id: uuid::Uuid::new_v4().to_string(),
        owner: owner.to_string(),
        source_url: source_url.to_string(),
        category: category.to_string(),
        filename: filename.to_string(),
        destination_path,
        status: DownloadStatus::Pending,
        bytes_transferred: 0,
        bytes_total: 0,
        percent_complete: 0.0,
        started_at: chrono::Utc::now().to_rfc3339(),
        completed_at: None,
        error_message: None,
        failure: None,
        cancel_requested: false,
    }
}
