use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for modelfetch
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/modelfetch/config.toml\n- See example: config/default.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IPC error: {0}\n\nTroubleshooting:\n- Is the daemon running? Start with: modelfetch daemon\n- Check socket path: $XDG_RUNTIME_DIR/modelfetch.sock\n- Try restarting the daemon")]
    Ipc(String),

    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("Invalid category: {category} (valid: {})", .valid.join(", "))]
    UnknownCategory { category: String, valid: Vec<String> },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Download not found: {0}")]
    NotFound(String),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Security policy rejections, raised before any network activity
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Download blocked: source not allowed. Only trusted model hosts are permitted. Got: {url}")]
    SourceNotAllowed { url: String },

    #[error("Download blocked: file type not allowed. Allowed: {}. Got: {extension}", .allowed.join(", "))]
    FileTypeNotAllowed {
        extension: String,
        allowed: Vec<String>,
    },

    #[error("Download blocked: invalid filename (path traversal detected): {filename}")]
    InvalidFilename { filename: String },
}

/// Failures while streaming a download. Recorded on the download, never
/// returned to the caller that started it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Model too large: {} (max: {})", format_size(.size), format_size(.max))]
    SizeLimitExceeded { size: u64, max: u64 },

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    LocalIo(String),
}

fn format_size(bytes: &u64) -> String {
    crate::downloads::format_bytes(*bytes)
}

impl TransferError {
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::SizeLimitExceeded { .. } => FailureKind::SizeLimit,
            Self::Upstream(_) => FailureKind::Upstream,
            Self::LocalIo(_) => FailureKind::LocalIo,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::LocalIo(e.to_string())
    }
}

/// Why a download ended in `failed`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SizeLimit,
    Upstream,
    LocalIo,
}

/// Error category reported over the request surface
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingFields,
    InvalidCategory,
    Rejected,
    NotFound,
    Internal,
}

impl ErrorKind {
    /// HTTP status a host web server should answer with
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            Self::MissingFields | Self::InvalidCategory => 400,
            Self::Rejected => 403,
            Self::NotFound => 404,
            Self::Internal => 500,
        }
    }
}

impl FetchError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingFields(_) => ErrorKind::MissingFields,
            Self::UnknownCategory { .. } => ErrorKind::InvalidCategory,
            Self::Validation(_) => ErrorKind::Rejected,
            Self::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
