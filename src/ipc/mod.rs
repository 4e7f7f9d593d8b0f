pub mod client;
pub mod server;

use crate::downloads::{DownloadRecord, StartReply, StartRequest};
use crate::error::{ErrorKind, FetchError};
use serde::{Deserialize, Serialize};

/// Message returned when a cancel request has nothing to act on
pub const CANCEL_FAILED_MESSAGE: &str = "Download not found or already completed";

/// IPC Commands
///
/// One JSON line per connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(StartRequest),
    Status { id: String },
    Cancel { id: String },
    List,
    /// Stream snapshots for one download until it reaches a terminal state
    Watch { id: String },
}

/// IPC Responses
///
/// Each response is one JSON line. `Watch` answers with a sequence of
/// `Record` lines.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Response {
    Started(StartReply),
    Record(DownloadRecord),
    Records(Vec<DownloadRecord>),
    Cancel { success: bool, message: String },
    Error { kind: ErrorKind, message: String },
}

impl From<&FetchError> for Response {
    fn from(e: &FetchError) -> Self {
        Self::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
