//! Transfer worker: streams one download to scratch space and publishes it.
//!
//! ```text
//! pending ──begin──▶ downloading ──▶ completed
//!                         │
//!                         ├──▶ failed     (upstream, size limit, local I/O)
//!                         └──▶ cancelled  (cooperative, between chunks)
//! ```
//!
//! `downloading` covers the wait for a transfer slot as well as streaming.
//!
//! Partial data only ever lives at `<scratch_dir>/<id>.part`. The destination
//! is written by copying the finished file, so it works when the model
//! directory is on a filesystem that can't take a rename from scratch.

use crate::config::Config;
use crate::downloads::broadcast::ProgressBroadcaster;
use crate::downloads::fetch::{ByteStream, Fetcher};
use crate::downloads::format_bytes;
use crate::downloads::record::DownloadRecord;
use crate::downloads::registry::{DownloadRegistry, Outcome};
use crate::error::TransferError;
use bytes::Bytes;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Limits and locations shared by every worker
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub scratch_dir: PathBuf,
    pub max_size_bytes: u64,
    pub chunk_size: usize,
    pub progress_step_percent: f64,
    pub idle_timeout: Option<Duration>,
}

impl TransferSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let idle = config.transfer.idle_timeout_secs;
        Self {
            scratch_dir: config.storage.scratch_dir.clone(),
            max_size_bytes: config.transfer.max_size_bytes,
            chunk_size: config.transfer.chunk_size_bytes,
            progress_step_percent: config.transfer.progress_step_percent,
            idle_timeout: (idle > 0).then(|| Duration::from_secs(idle)),
        }
    }

    /// Scratch file for a download; unique because ids are
    #[must_use]
    pub fn temp_path(&self, id: &str) -> PathBuf {
        self.scratch_dir.join(format!("{id}.part"))
    }
}

/// One unit of work per accepted download
pub struct TransferWorker {
    id: String,
    registry: Arc<DownloadRegistry>,
    broadcaster: ProgressBroadcaster,
    fetcher: Arc<dyn Fetcher>,
    settings: Arc<TransferSettings>,
}

impl TransferWorker {
    #[must_use]
    pub fn new(
        id: String,
        registry: Arc<DownloadRegistry>,
        broadcaster: ProgressBroadcaster,
        fetcher: Arc<dyn Fetcher>,
        settings: Arc<TransferSettings>,
    ) -> Self {
        Self {
            id,
            registry,
            broadcaster,
            fetcher,
            settings,
        }
    }

    /// Claim the download, wait for a transfer slot, then run.
    ///
    /// The record is `downloading` (and cancellable) while it waits, so a
    /// queued download can be stopped before it ever opens the upstream.
    pub async fn run_with_permit(self, slots: Arc<Semaphore>) -> Option<DownloadRecord> {
        let (record, cancel) = self.claim()?;
        if slots.available_permits() == 0 {
            tracing::debug!(id = %record.id, "Waiting for a transfer slot");
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Outcome::Cancelled,
            permit = slots.acquire_owned() => match permit {
                Ok(_permit) => self.execute(&record, &cancel).await,
                Err(_) => Outcome::Failed(TransferError::LocalIo(
                    "Transfer slots are closed".to_string(),
                )),
            },
        };

        self.settle(&outcome)
    }

    /// Drive the download to a terminal state and return the final snapshot.
    ///
    /// Returns `None` if the record is unknown or another worker already
    /// started it.
    pub async fn run(self) -> Option<DownloadRecord> {
        let (record, cancel) = self.claim()?;
        let outcome = self.execute(&record, &cancel).await;
        self.settle(&outcome)
    }

    /// Move the record to `downloading` and announce it
    fn claim(&self) -> Option<(DownloadRecord, CancellationToken)> {
        let Some(record) = self.registry.begin(&self.id) else {
            tracing::warn!(id = %self.id, "Download is not pending, refusing to start a second worker");
            return None;
        };
        let cancel = self.registry.cancel_token(&self.id)?;

        tracing::info!(
            id = %record.id,
            owner = %record.owner,
            "Starting: {} -> {}",
            record.filename,
            record.destination_path.display()
        );
        self.broadcaster.publish(record.clone());

        Some((record, cancel))
    }

    async fn execute(&self, record: &DownloadRecord, cancel: &CancellationToken) -> Outcome {
        let temp_path = self.settings.temp_path(&self.id);
        let outcome = match self.transfer(record, &temp_path, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(e),
        };
        remove_if_exists(&temp_path).await;
        outcome
    }

    /// Record the terminal state, log it, and publish the final snapshot
    fn settle(&self, outcome: &Outcome) -> Option<DownloadRecord> {
        let snapshot = self.registry.finish(&self.id, outcome)?;
        match outcome {
            Outcome::Completed => tracing::info!(
                id = %snapshot.id,
                owner = %snapshot.owner,
                "Completed: {} ({})",
                snapshot.filename,
                format_bytes(snapshot.bytes_total)
            ),
            Outcome::Cancelled => {
                tracing::info!(id = %snapshot.id, "Cancelled: {}", snapshot.filename);
            }
            Outcome::Failed(e) => {
                tracing::error!(id = %snapshot.id, "Failed: {} - {e}", snapshot.filename);
            }
        }
        self.broadcaster.publish(snapshot.clone());

        Some(snapshot)
    }

    async fn transfer(
        &self,
        record: &DownloadRecord,
        temp_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome, TransferError> {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(Outcome::Cancelled),
            response = self.fetcher.open(&record.source_url) => response?,
        };

        let declared = response.content_length.unwrap_or(0);
        if declared > self.settings.max_size_bytes {
            return Err(TransferError::SizeLimitExceeded {
                size: declared,
                max: self.settings.max_size_bytes,
            });
        }
        self.registry.update(&self.id, |r| r.bytes_total = declared);

        tokio::fs::create_dir_all(&self.settings.scratch_dir)
            .await
            .map_err(|e| {
                TransferError::LocalIo(format!(
                    "Failed to create scratch dir {}: {e}",
                    self.settings.scratch_dir.display()
                ))
            })?;
        check_disk_space(&self.settings.scratch_dir, declared)?;

        let mut file = File::create(temp_path).await.map_err(|e| {
            TransferError::LocalIo(format!("Failed to create {}: {e}", temp_path.display()))
        })?;
        let mut body = response.body;
        let mut buffer: Vec<u8> = Vec::with_capacity(self.settings.chunk_size);
        let mut last_emitted = 0.0_f64;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Outcome::Cancelled),
                next = self.next_chunk(&mut body) => next?,
            };
            let Some(chunk) = next else { break };

            buffer.extend_from_slice(&chunk);
            if buffer.len() >= self.settings.chunk_size {
                file.write_all(&buffer).await?;
                buffer.clear();
            }

            let snapshot = self
                .registry
                .update(&self.id, |r| r.add_bytes(chunk.len() as u64))
                .ok_or_else(|| TransferError::LocalIo("Download record vanished".to_string()))?;

            if snapshot.bytes_transferred > self.settings.max_size_bytes {
                return Err(TransferError::SizeLimitExceeded {
                    size: snapshot.bytes_transferred,
                    max: self.settings.max_size_bytes,
                });
            }
            if snapshot.cancel_requested {
                return Ok(Outcome::Cancelled);
            }
            if snapshot.percent_complete - last_emitted >= self.settings.progress_step_percent {
                tracing::debug!(id = %snapshot.id, "Progress: {}", snapshot.progress_line());
                last_emitted = snapshot.percent_complete;
                self.broadcaster.publish(snapshot);
            }
        }

        if !buffer.is_empty() {
            file.write_all(&buffer).await?;
        }
        file.flush().await?;
        drop(file);

        let received = self
            .registry
            .get(&self.id)
            .map_or(0, |r| r.bytes_transferred);
        if declared > 0 && received < declared {
            return Err(TransferError::Upstream(format!(
                "Transfer ended early: received {} of {}",
                format_bytes(received),
                format_bytes(declared)
            )));
        }

        if !self.registry.begin_publish(&self.id) {
            return Ok(Outcome::Cancelled);
        }
        publish(temp_path, &record.destination_path).await?;

        Ok(Outcome::Completed)
    }

    async fn next_chunk(&self, body: &mut ByteStream) -> Result<Option<Bytes>, TransferError> {
        match self.settings.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, body.next())
                .await
                .map_err(|_| {
                    TransferError::Upstream(format!(
                        "Upstream stalled: no data for {}s",
                        limit.as_secs_f64()
                    ))
                })?
                .transpose(),
            None => body.next().await.transpose(),
        }
    }
}

/// Copy the finished file into place, then drop the scratch copy.
/// A half-copied destination is removed on failure.
async fn publish(temp_path: &Path, destination: &Path) -> Result<(), TransferError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            TransferError::LocalIo(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }

    if let Err(e) = tokio::fs::copy(temp_path, destination).await {
        remove_if_exists(destination).await;
        return Err(TransferError::LocalIo(format!(
            "Failed to publish to {}: {e}",
            destination.display()
        )));
    }

    remove_if_exists(temp_path).await;
    Ok(())
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
    }
}

/// Refuse to start when the scratch filesystem can't hold the declared size
#[allow(clippy::unnecessary_cast)]
fn check_disk_space(dir: &Path, required_bytes: u64) -> Result<(), TransferError> {
    if required_bytes == 0 {
        return Ok(());
    }

    let stats = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| TransferError::LocalIo(format!("Failed to check disk space: {e}")))?;
    let available_bytes =
        (stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64);

    if available_bytes < required_bytes {
        return Err(TransferError::LocalIo(format!(
            "Not enough disk space in {}: {} required, {} available",
            dir.display(),
            format_bytes(required_bytes),
            format_bytes(available_bytes)
        )));
    }

    Ok(())
}
