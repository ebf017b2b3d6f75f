use reqwest::header::RANGE;
use std::time::Duration;
use tokio::time::timeout;

/// HTTP client shared by the index locator and the range fetcher
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout_duration: Duration,
    user_agent: String,
    max_content_size: usize,
}

impl HttpClient {
    /// Create a new HTTP client with the default body size limit
    pub fn new(user_agent: String, timeout_secs: u64) -> Result<Self, FetchError> {
        Self::with_content_limit(
            user_agent,
            timeout_secs,
            crate::config::Config::MAX_CONTENT_SIZE,
        )
    }

    /// Create a new HTTP client with custom content size limit
    pub fn with_content_limit(
        user_agent: String,
        timeout_secs: u64,
        max_content_size: usize,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("client build failed: {}", e)))?;

        Ok(Self {
            client,
            timeout_duration: Duration::from_secs(timeout_secs),
            user_agent,
            max_content_size,
        })
    }

    /// Get the user agent string used by this client
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// GET a URL and hand back the live response so the caller can stream the body.
    /// Status codes are not checked here.
    pub async fn fetch_stream(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        timeout(self.timeout_duration, self.client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(Self::classify_error)
    }

    /// GET a URL and buffer the whole body.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchResult, FetchError> {
        let response = self.fetch_stream(url).await?;
        self.collect(response).await
    }

    /// GET `[offset, offset + length - 1]` of a remote object. The caller validates the status.
    pub async fn fetch_range(
        &self,
        url: &str,
        offset: u64,
        length: u64,
    ) -> Result<FetchResult, FetchError> {
        let last = offset.saturating_add(length).saturating_sub(1);
        let response = timeout(
            self.timeout_duration,
            self.client
                .get(url)
                .header(RANGE, format!("bytes={}-{}", offset, last))
                .send(),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(Self::classify_error)?;

        self.collect(response).await
    }

    async fn collect(&self, response: reqwest::Response) -> Result<FetchResult, FetchError> {
        let status_code = response.status().as_u16();

        // Check content length header first
        if let Some(length) = response.content_length() {
            if length as usize > self.max_content_size {
                return Err(FetchError::ContentTooLarge(
                    length as usize,
                    self.max_content_size,
                ));
            }
        }

        let content = timeout(self.timeout_duration, response.bytes())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(|e| FetchError::BodyError(e.to_string()))?;

        if content.len() > self.max_content_size {
            return Err(FetchError::ContentTooLarge(
                content.len(),
                self.max_content_size,
            ));
        }

        Ok(FetchResult {
            content: content.to_vec(),
            status_code,
        })
    }

    /// Map a reqwest failure onto the transient/permanent split the retry policy works on.
    fn classify_error(error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout
        } else if error.is_builder() || error.is_redirect() {
            FetchError::InvalidRequest(error.to_string())
        } else if error.is_connect() {
            FetchError::Connect(error.to_string())
        } else if error.is_body() || error.is_decode() {
            FetchError::BodyError(error.to_string())
        } else {
            FetchError::Transport(error.to_string())
        }
    }
}

/// Result of a buffered HTTP fetch
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub content: Vec<u8>,
    pub status_code: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Malformed URL or request, or a redirect loop. Sending it again cannot help.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    /// The connection broke while the request was in flight (reset, closed early).
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Failed to read response body: {0}")]
    BodyError(String),

    #[error("Content too large: {0} bytes (max: {1} bytes)")]
    ContentTooLarge(usize, usize),
}

impl FetchError {
    /// Timeouts and broken connections are transient; a bad request or oversized body is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout
            | FetchError::Connect(_)
            | FetchError::Transport(_)
            | FetchError::BodyError(_) => true,
            FetchError::InvalidRequest(_) | FetchError::ContentTooLarge(_, _) => false,
        }
    }
}
