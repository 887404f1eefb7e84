use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!("news-catcher/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching a feed payload.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, invalid URL, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    BadStatus(u16),
    /// The fetcher's own per-request timeout elapsed
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// The caller's deadline elapsed before the request completed
    #[error("Request cancelled: deadline elapsed")]
    Cancelled,
}

/// Limits applied to every fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherConfig {
    /// Upper bound for one request, headers and body included.
    pub timeout: Duration,
    /// Bodies are truncated to this many bytes.
    pub max_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// HTTP client for feed payloads.
///
/// Cloning is cheap: the underlying `reqwest::Client` shares its connection
/// pool, so every batch task gets its own handle.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl FeedFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Fetches `url`, giving up at `deadline` or after the configured
    /// timeout, whichever comes first.
    ///
    /// Dropping the request future on expiry closes the connection, so
    /// nothing keeps running past the deadline.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Cancelled`] - `deadline` elapsed first
    /// - [`FetchError::Timeout`] - the per-fetch timeout elapsed first
    /// - [`FetchError::BadStatus`] - non-2xx response
    /// - [`FetchError::Network`] - connection, TLS or body read failure
    pub async fn fetch(&self, url: &str, deadline: Instant) -> Result<Vec<u8>, FetchError> {
        let own_deadline = Instant::now() + self.config.timeout;
        let cancelled = deadline <= own_deadline;
        let limit = if cancelled { deadline } else { own_deadline };

        match tokio::time::timeout_at(limit, self.fetch_limited(url)).await {
            Ok(result) => result,
            Err(_) if cancelled => Err(FetchError::Cancelled),
            Err(_) => Err(FetchError::Timeout(self.config.timeout)),
        }
    }

    async fn fetch_limited(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::BadStatus(response.status().as_u16()));
        }

        read_capped_bytes(response, self.config.max_bytes).await
    }
}

/// Reads a response body, stopping once `limit` bytes are buffered.
///
/// Oversized bodies are truncated rather than rejected; the rest of the
/// stream is dropped unread.
async fn read_capped_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let capacity = response
        .content_length()
        .map(|len| (len as usize).min(limit))
        .unwrap_or(0);
    let mut bytes = Vec::with_capacity(capacity);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let room = limit - bytes.len();
        if chunk.len() > room {
            bytes.extend_from_slice(&chunk[..room]);
            tracing::debug!(limit = limit, "Response body truncated at size limit");
            break;
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
