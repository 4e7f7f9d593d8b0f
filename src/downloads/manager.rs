use crate::config::Config;
use crate::downloads::broadcast::ProgressBroadcaster;
use crate::downloads::fetch::{Fetcher, HttpFetcher};
use crate::downloads::record::DownloadRecord;
use crate::downloads::registry::DownloadRegistry;
use crate::downloads::validate::Validator;
use crate::downloads::worker::{TransferSettings, TransferWorker};
use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Semaphore;

/// A request to fetch one model file
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub filename: String,
}

/// Answer to a start request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartReply {
    pub id: Option<String>,
    pub status: String,
    pub destination_path: PathBuf,
    pub message: Option<String>,
}

pub const STATUS_ALREADY_EXISTS: &str = "already_exists";
pub const STATUS_ALREADY_DOWNLOADING: &str = "already_downloading";

/// Owns every download for the lifetime of the daemon.
///
/// Built once at startup and shared (via `Arc`) with whatever serves requests.
pub struct DownloadManager {
    registry: Arc<DownloadRegistry>,
    validator: Validator,
    broadcaster: ProgressBroadcaster,
    fetcher: Arc<dyn Fetcher>,
    settings: Arc<TransferSettings>,
    slots: Arc<Semaphore>,
    models_dir: PathBuf,
    categories: Vec<String>,
    category_dirs: BTreeMap<String, PathBuf>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("downloads", &self.registry.len())
            .field("models_dir", &self.models_dir)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Create a manager that fetches over HTTP
    pub fn new(config: &Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(Duration::from_secs(config.transfer.connect_timeout_secs))?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    /// Create a manager with a custom byte source
    #[must_use]
    pub fn with_fetcher(config: &Config, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            registry: Arc::new(DownloadRegistry::new()),
            validator: Validator::from_config(&config.sources),
            broadcaster: ProgressBroadcaster::new(),
            fetcher,
            settings: Arc::new(TransferSettings::from_config(config)),
            slots: Arc::new(Semaphore::new(config.transfer.max_concurrent)),
            models_dir: config.storage.models_dir.clone(),
            categories: config.storage.categories.clone(),
            category_dirs: config.storage.category_dirs.clone(),
        }
    }

    /// Validate a request and, if accepted, start a transfer in the background.
    ///
    /// Errors here are returned to the caller; anything that goes wrong once
    /// the transfer is running is recorded on the download instead.
    pub async fn start(&self, request: StartRequest) -> Result<StartReply> {
        let url = request.url.trim();
        let category = request.category.trim();
        let filename = request.filename.trim();
        let owner = match request.owner.trim() {
            "" => "anonymous",
            owner => owner,
        };

        let missing: Vec<&'static str> = [("url", url), ("category", category), ("filename", filename)]
            .into_iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(name, _)| name)
            .collect();
        if !missing.is_empty() {
            return Err(FetchError::MissingFields(missing));
        }

        let Some(dir) = self.category_dir(category) else {
            return Err(FetchError::UnknownCategory {
                category: category.to_string(),
                valid: self.categories.clone(),
            });
        };

        if let Err(e) = self.validator.validate(url, filename) {
            tracing::warn!(owner, "Blocked: {e}");
            return Err(e.into());
        }

        let destination = dir.join(filename);
        if tokio::fs::try_exists(&destination).await? {
            tracing::info!(owner, "Already exists (skipped): {}", destination.display());
            return Ok(StartReply {
                id: None,
                status: STATUS_ALREADY_EXISTS.to_string(),
                message: Some(format!("Model already exists: {filename}")),
                destination_path: destination,
            });
        }

        let record = match self
            .registry
            .create_exclusive(owner, url, category, filename, destination)
        {
            Ok(record) => record,
            Err(active) => {
                tracing::info!(id = %active.id, owner, "Already downloading: {filename}");
                return Ok(StartReply {
                    id: Some(active.id),
                    status: STATUS_ALREADY_DOWNLOADING.to_string(),
                    message: Some(format!("Model is already being downloaded: {filename}")),
                    destination_path: active.destination_path,
                });
            }
        };

        let worker = TransferWorker::new(
            record.id.clone(),
            Arc::clone(&self.registry),
            self.broadcaster.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.settings),
        );
        tokio::spawn(worker.run_with_permit(Arc::clone(&self.slots)));

        tracing::info!(
            id = %record.id,
            owner,
            "Queued: {filename} ({category})"
        );

        Ok(StartReply {
            id: Some(record.id),
            status: record.status.to_string(),
            destination_path: record.destination_path,
            message: None,
        })
    }

    /// Current snapshot of a download
    pub fn status(&self, id: &str) -> Result<DownloadRecord> {
        self.registry
            .get(id)
            .ok_or_else(|| FetchError::NotFound(id.to_string()))
    }

    /// Ask a running download to stop; true if the request was newly recorded
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self.registry.request_cancel(id);
        if cancelled {
            tracing::info!(id, "Cancellation requested");
        } else {
            tracing::debug!(id, "Nothing to cancel");
        }
        cancelled
    }

    #[must_use]
    pub fn list(&self) -> Vec<DownloadRecord> {
        self.registry.list()
    }

    /// Receive every snapshot the workers publish
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadRecord> {
        self.broadcaster.subscribe()
    }

    /// Resolve once the download reaches a terminal state
    pub async fn wait(&self, id: &str) -> Result<DownloadRecord> {
        let mut rx = self.subscribe();
        loop {
            let current = self.status(id)?;
            if current.status.is_terminal() {
                return Ok(current);
            }

            match rx.recv().await {
                Ok(snapshot) if snapshot.id == id && snapshot.status.is_terminal() => {
                    return Ok(snapshot)
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    return Err(FetchError::Other("Progress channel closed".to_string()))
                }
            }
        }
    }

    #[must_use]
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Directory a category publishes into, if the category is known
    #[must_use]
    pub fn category_dir(&self, category: &str) -> Option<PathBuf> {
        if !self.categories.iter().any(|c| c == category) {
            return None;
        }
        Some(
            self.category_dirs
                .get(category)
                .cloned()
                .unwrap_or_else(|| self.models_dir.join(category)),
        )
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &std::path::Path {
        &self.settings.scratch_dir
    }

    /// Delete `*.part` files left by a previous daemon that was stopped
    /// mid-transfer. Call before accepting requests; returns how many were
    /// removed.
    pub async fn sweep_scratch(&self) -> usize {
        let dir = &self.settings.scratch_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!("Failed to read scratch dir {}: {e}", dir.display());
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to read scratch dir {}: {e}", dir.display());
                    break;
                }
            };
            let path = entry.path();
            if path.extension() != Some(std::ffi::OsStr::new("part")) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
            }
        }

        if removed > 0 {
            tracing::info!("Removed {removed} partial download(s) from {}", dir.display());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloads::fetch::FetchResponse;
    use crate::downloads::record::DownloadStatus;
    use crate::error::{ErrorKind, TransferError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use tempfile::TempDir;

    struct StaticFetcher(Vec<u8>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn open(&self, _url: &str) -> std::result::Result<FetchResponse, TransferError> {
            let body = vec![Ok(Bytes::from(self.0.clone()))];
            Ok(FetchResponse {
                content_length: Some(self.0.len() as u64),
                body: futures_util::stream::iter(body).boxed(),
            })
        }
    }

    fn manager(dir: &TempDir) -> DownloadManager {
        let mut config = Config::default();
        config.storage.models_dir = dir.path().join("models");
        config.storage.scratch_dir = dir.path().join("scratch");
        config
            .storage
            .category_dirs
            .insert("vae".to_string(), dir.path().join("elsewhere/vae"));
        DownloadManager::with_fetcher(&config, Arc::new(StaticFetcher(b"weights".to_vec())))
    }

    fn request(filename: &str) -> StartRequest {
        StartRequest {
            owner: "alice".to_string(),
            url: format!("https://huggingface.co/org/repo/resolve/main/{filename}"),
            category: "checkpoints".to_string(),
            filename: filename.to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let reply = manager.start(request("model.safetensors")).await.unwrap();
        assert_eq!(reply.status, "pending");
        let id = reply.id.unwrap();
        assert_eq!(
            reply.destination_path,
            dir.path().join("models/checkpoints/model.safetensors")
        );

        let done = manager.wait(&id).await.unwrap();
        assert_eq!(done.status, DownloadStatus::Completed);
        assert_eq!(std::fs::read(&done.destination_path).unwrap(), b"weights");
        assert_eq!(manager.status(&id).unwrap(), done);
    }

    #[tokio::test]
    async fn test_missing_fields_are_distinct_from_rejection() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let err = manager
            .start(StartRequest {
                url: "  ".to_string(),
                ..request("model.safetensors")
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingFields);
        assert!(err.to_string().contains("url"));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_category() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let err = manager
            .start(StartRequest {
                category: "spells".to_string(),
                ..request("model.safetensors")
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCategory);
        assert!(err.to_string().contains("loras"));
    }

    #[tokio::test]
    async fn test_category_dir_override() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert_eq!(
            manager.category_dir("vae").unwrap(),
            dir.path().join("elsewhere/vae")
        );
        assert_eq!(
            manager.category_dir("loras").unwrap(),
            dir.path().join("models/loras")
        );
        assert!(manager.category_dir("nope").is_none());
    }

    #[tokio::test]
    async fn test_owner_defaults_to_anonymous() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let reply = manager
            .start(StartRequest {
                owner: String::new(),
                ..request("model.safetensors")
            })
            .await
            .unwrap();
        let record = manager.status(&reply.id.unwrap()).unwrap();
        assert_eq!(record.owner, "anonymous");
    }

    #[tokio::test]
    async fn test_status_unknown_id() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert_eq!(manager.status("nope").unwrap_err().kind(), ErrorKind::NotFound);
        assert!(!manager.cancel("nope"));
    }

    #[tokio::test]
    async fn test_sweep_scratch_removes_only_partials() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert_eq!(manager.sweep_scratch().await, 0);

        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("a.part"), b"half").unwrap();
        std::fs::write(scratch.join("b.part"), b"").unwrap();
        std::fs::write(scratch.join("notes.txt"), b"keep").unwrap();

        assert_eq!(manager.sweep_scratch().await, 2);
        assert!(!scratch.join("a.part").exists());
        assert!(!scratch.join("b.part").exists());
        assert!(scratch.join("notes.txt").exists());
    }
}
