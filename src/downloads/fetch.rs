use crate::error::TransferError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;

/// Body of an upstream response, chunk by chunk
pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// An opened upstream response
pub struct FetchResponse {
    /// Size the upstream declared, if any
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("content_length", &self.content_length)
            .field("body", &"Stream { ... }")
            .finish()
    }
}

/// Source of artifact bytes
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Start a streaming GET. Non-success statuses are errors.
    async fn open(&self, url: &str) -> Result<FetchResponse, TransferError>;
}

/// `reqwest`-backed fetcher
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher. Only connecting is bounded by a timeout; the body
    /// can stream for as long as it takes.
    pub fn new(connect_timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("modelfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransferError::Upstream(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn open(&self, url: &str) -> Result<FetchResponse, TransferError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransferError::Upstream(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Upstream(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| TransferError::Upstream(format!("Failed to read chunk: {e}")))
            })
            .boxed();

        Ok(FetchResponse {
            content_length,
            body,
        })
    }
}
