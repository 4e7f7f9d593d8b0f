use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Highest percentage a download can report before it is published.
/// Exactly 100 is reserved for `completed`.
pub const MAX_STREAMING_PERCENT: f64 = 99.99;

/// Lifecycle of a download
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one model fetch, from request to terminal outcome
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DownloadRecord {
    pub id: String,
    pub owner: String,
    pub source_url: String,
    pub category: String,
    pub filename: String,
    pub destination_path: PathBuf,

    pub status: DownloadStatus,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub percent_complete: f64,

    pub started_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub failure: Option<FailureKind>,

    pub cancel_requested: bool,
}

impl DownloadRecord {
    /// Count streamed bytes and advance the percentage.
    ///
    /// The percentage never moves backwards and stays below 100 until the
    /// download is published.
    #[allow(clippy::cast_precision_loss)]
    pub fn add_bytes(&mut self, n: u64) {
        self.bytes_transferred += n;
        if self.bytes_total > 0 {
            let percent = (self.bytes_transferred as f64 * 100.0 / self.bytes_total as f64)
                .min(MAX_STREAMING_PERCENT);
            self.percent_complete = self.percent_complete.max(percent);
        }
    }

    /// Human-readable one-line progress summary
    #[must_use]
    pub fn progress_line(&self) -> String {
        format!(
            "{} {:.1}% ({} / {})",
            self.filename,
            self.percent_complete,
            super::format_bytes(self.bytes_transferred),
            super::format_bytes(self.bytes_total)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total: u64) -> DownloadRecord {
        DownloadRecord {
            id: "abc".to_string(),
            owner: "alice".to_string(),
            source_url: "https://huggingface.co/x/model.safetensors".to_string(),
            category: "checkpoints".to_string(),
            filename: "model.safetensors".to_string(),
            destination_path: PathBuf::from("/models/checkpoints/model.safetensors"),
            status: DownloadStatus::Downloading,
            bytes_transferred: 0,
            bytes_total: total,
            percent_complete: 0.0,
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            error_message: None,
            failure: None,
            cancel_requested: false,
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!DownloadStatus::Pending.is_terminal());
        assert!(!DownloadStatus::Downloading.is_terminal());
        assert!(DownloadStatus::Completed.is_terminal());
        assert!(DownloadStatus::Failed.is_terminal());
        assert!(DownloadStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_add_bytes_tracks_percent() {
        let mut rec = record(1000);
        rec.add_bytes(250);
        assert_eq!(rec.bytes_transferred, 250);
        assert!((rec.percent_complete - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_percent_never_reaches_100_while_streaming() {
        let mut rec = record(1000);
        rec.add_bytes(1000);
        assert!(rec.percent_complete < 100.0);

        // Upstream sending more than it declared must not push past the cap
        rec.add_bytes(500);
        assert!(rec.percent_complete < 100.0);
    }

    #[test]
    fn test_unknown_total_keeps_percent_at_zero() {
        let mut rec = record(0);
        rec.add_bytes(4096);
        assert_eq!(rec.bytes_transferred, 4096);
        assert!(rec.percent_complete.abs() < f64::EPSILON);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DownloadStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(DownloadStatus::Downloading.to_string(), "downloading");
    }
}
