use crate::config::Config;
use crate::downloads::DownloadRecord;
use crate::error::{FetchError, Result};
use crate::ipc::{Command, Response};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;

/// IPC client for sending commands to daemon
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create client for the socket named by the config
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            socket_path: config.socket_path()?,
        })
    }

    /// Create client with custom socket path
    #[must_use]
    pub const fn with_socket_path(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send command to daemon and receive response
    pub async fn send_command(&self, cmd: Command) -> Result<Response> {
        let mut lines = self.request(&cmd).await?;
        read_response(&mut lines)
            .await?
            .ok_or_else(|| FetchError::Ipc("Connection closed before response".to_string()))
    }

    /// Follow one download, calling `on_update` for every snapshot.
    /// Returns the terminal snapshot.
    pub async fn watch<F>(&self, id: &str, mut on_update: F) -> Result<DownloadRecord>
    where
        F: FnMut(&DownloadRecord),
    {
        let mut lines = self.request(&Command::Watch { id: id.to_string() }).await?;

        while let Some(response) = read_response(&mut lines).await? {
            match response {
                Response::Record(record) => {
                    on_update(&record);
                    if record.status.is_terminal() {
                        return Ok(record);
                    }
                }
                Response::Error { kind, message } => {
                    tracing::debug!(?kind, "Watch refused");
                    return Err(FetchError::Other(message));
                }
                other => {
                    return Err(FetchError::Ipc(format!("Unexpected response: {other:?}")));
                }
            }
        }

        Err(FetchError::Ipc(
            "Daemon closed the stream before the download finished".to_string(),
        ))
    }

    async fn request(&self, cmd: &Command) -> Result<Lines<BufReader<OwnedReadHalf>>> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            FetchError::Ipc(format!(
                "Could not connect to daemon at {}. Is it running? Error: {e}",
                self.socket_path.display()
            ))
        })?;
        let (read_half, mut write_half) = stream.into_split();

        // Serialize and send command
        let mut cmd_bytes = serde_json::to_vec(cmd)
            .map_err(|e| FetchError::Ipc(format!("Failed to serialize command: {e}")))?;
        cmd_bytes.push(b'\n');

        write_half
            .write_all(&cmd_bytes)
            .await
            .map_err(|e| FetchError::Ipc(format!("Failed to send command: {e}")))?;

        Ok(BufReader::new(read_half).lines())
    }
}

async fn read_response(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Option<Response>> {
    let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| FetchError::Ipc(format!("Failed to read response: {e}")))?
    else {
        return Ok(None);
    };

    serde_json::from_str(&line)
        .map(Some)
        .map_err(|e| FetchError::Ipc(format!("Invalid response: {e}")))
}
