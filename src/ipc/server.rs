use crate::downloads::{DownloadManager, DownloadRecord};
use crate::error::{FetchError, Result};
use crate::ipc::{Command, Response, CANCEL_FAILED_MESSAGE};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

/// Unix socket IPC server
pub struct IpcServer {
    socket_path: PathBuf,
    manager: Arc<DownloadManager>,
    ready_tx: Option<oneshot::Sender<()>>,
}

impl IpcServer {
    /// Create new IPC server
    ///
    /// # Arguments
    /// * `manager` - Download manager every request is routed to
    /// * `socket_path` - Where to bind the Unix socket
    #[must_use]
    pub const fn new(manager: Arc<DownloadManager>, socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            manager,
            ready_tx: None,
        }
    }

    /// Set ready signal channel (for testing)
    #[must_use]
    pub fn with_ready_signal(mut self, ready_tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(ready_tx);
        self
    }

    /// Start IPC server
    ///
    /// Binds to Unix socket and handles incoming connections.
    /// Runs until error or the task is dropped.
    pub async fn start(mut self) -> Result<()> {
        // Remove old socket if exists
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| FetchError::Ipc(format!("Failed to remove old socket: {e}")))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            FetchError::Ipc(format!(
                "Failed to bind socket at {}: {e}",
                self.socket_path.display()
            ))
        })?;

        tracing::info!("IPC server listening on {:?}", self.socket_path);

        // Signal ready if channel provided (for testing)
        if let Some(ready_tx) = self.ready_tx.take() {
            ready_tx.send(()).ok();
        }

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_client(stream, manager).await {
                            tracing::error!("Client handler error: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {e}");
                }
            }
        }
    }

    /// Handle single client connection
    async fn handle_client(stream: UnixStream, manager: Arc<DownloadManager>) -> Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut line = String::new();
        let n = BufReader::new(read_half)
            .read_line(&mut line)
            .await
            .map_err(|e| FetchError::Ipc(format!("Failed to read from client: {e}")))?;

        if n == 0 {
            return Ok(());
        }

        let cmd: Command = match serde_json::from_str(line.trim_end()) {
            Ok(cmd) => cmd,
            Err(e) => {
                let err = FetchError::Ipc(format!("Invalid command: {e}"));
                write_response(&mut writer, &Response::from(&err)).await?;
                return Err(err);
            }
        };

        tracing::debug!("Received command: {:?}", cmd);

        let response = match cmd {
            Command::Start(request) => match manager.start(request).await {
                Ok(reply) => Response::Started(reply),
                Err(e) => Response::from(&e),
            },
            Command::Status { id } => match manager.status(&id) {
                Ok(record) => Response::Record(record),
                Err(e) => Response::from(&e),
            },
            Command::Cancel { id } => {
                let success = manager.cancel(&id);
                Response::Cancel {
                    success,
                    message: if success {
                        "Cancellation requested".to_string()
                    } else {
                        CANCEL_FAILED_MESSAGE.to_string()
                    },
                }
            }
            Command::List => Response::Records(manager.list()),
            Command::Watch { id } => return Self::watch(&mut writer, &manager, &id).await,
        };

        write_response(&mut writer, &response).await
    }

    /// Stream snapshots for `id` until a terminal one has been written
    async fn watch(
        writer: &mut OwnedWriteHalf,
        manager: &DownloadManager,
        id: &str,
    ) -> Result<()> {
        // Subscribe before the first read so no transition slips between them
        let mut rx = manager.subscribe();
        let current = match manager.status(id) {
            Ok(record) => record,
            Err(e) => return write_response(writer, &Response::from(&e)).await,
        };
        let mut sent_bytes = current.bytes_transferred;
        if send_record(writer, current).await? {
            return Ok(());
        }

        loop {
            let snapshot = match rx.recv().await {
                // Queued snapshots can predate the one already sent
                Ok(snapshot) if snapshot.id == id && snapshot.bytes_transferred >= sent_bytes => {
                    snapshot
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(id, skipped, "Watcher lagged, resending current state");
                    manager.status(id)?
                }
                Err(RecvError::Closed) => return Ok(()),
            };
            sent_bytes = snapshot.bytes_transferred;
            if send_record(writer, snapshot).await? {
                return Ok(());
            }
        }
    }
}

/// Write one snapshot; true once it was terminal
async fn send_record(writer: &mut OwnedWriteHalf, record: DownloadRecord) -> Result<bool> {
    let terminal = record.status.is_terminal();
    write_response(writer, &Response::Record(record)).await?;
    Ok(terminal)
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let mut bytes = serde_json::to_vec(response)
        .map_err(|e| FetchError::Ipc(format!("Failed to serialize response: {e}")))?;
    bytes.push(b'\n');

    writer
        .write_all(&bytes)
        .await
        .map_err(|e| FetchError::Ipc(format!("Failed to write response: {e}")))?;

    Ok(())
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}
