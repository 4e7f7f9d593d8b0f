//! Model download manager.
//!
//! A request is validated, recorded in the registry, and handed to its own
//! transfer worker. The worker streams the artifact into scratch space,
//! reports progress through the broadcaster, and copies the finished file
//! into the shared models directory.
//!
//! ```text
//! StartRequest ─▶ Validator ─▶ DownloadRegistry ─▶ TransferWorker ─▶ models dir
//!                                     ▲                  │
//!                     status / cancel │                  ▼
//!                                              ProgressBroadcaster ─▶ subscribers
//! ```

pub mod broadcast;
pub mod fetch;
pub mod manager;
pub mod record;
pub mod registry;
pub mod validate;
pub mod worker;

pub use broadcast::ProgressBroadcaster;
pub use fetch::{FetchResponse, Fetcher, HttpFetcher};
pub use manager::{DownloadManager, StartReply, StartRequest};
pub use record::{DownloadRecord, DownloadStatus};
pub use registry::{DownloadRegistry, Outcome};
pub use validate::Validator;
pub use worker::{TransferSettings, TransferWorker};

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
