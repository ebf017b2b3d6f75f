use crate::backoff::RetryPolicy;
use crate::network::{FetchError, HttpClient};
use futures_util::TryStreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};

// Cap line size so a response missing newlines cannot grow one buffer without bound.
const MAX_LINE_SIZE: usize = 64 * 1024;

/// Errors specific to index service queries.
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    /// HTTP-level errors (4xx, 5xx).
    #[error("HTTP {0}: {1}")]
    Http(u16, String),
    /// Network errors (timeouts, connection failures).
    #[error("Network error: {0}")]
    Network(#[from] FetchError),
    /// Data parsing or validation errors.
    #[error("Data error: {0}")]
    Data(String),
    /// I/O errors while streaming the body.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LocatorError {
    /// Transient failures worth another attempt: timeouts, 5xx, rate limits, cut-off bodies.
    pub fn retryable(&self) -> bool {
        match self {
            LocatorError::Http(code, _) => matches!(code, 408 | 429 | 500..=599),
            LocatorError::Network(e) => e.is_retryable(),
            LocatorError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Other
            ),
            LocatorError::Data(_) => false,
        }
    }
}

impl From<serde_json::Error> for LocatorError {
    fn from(e: serde_json::Error) -> Self {
        LocatorError::Data(format!("JSON parse error: {}", e))
    }
}

/// One capture in the index: where a document's record lives inside an archive file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub url: String,
    pub filename: String,
    #[serde(deserialize_with = "flexible_u64")]
    pub offset: u64,
    #[serde(deserialize_with = "flexible_u64")]
    pub length: u64,
}

// The index service emits offsets and lengths as JSON strings.
fn flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        Text(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Entry of `collinfo.json`, listing the crawls the index server knows about.
#[derive(Debug, Deserialize)]
struct CollectionInfo {
    id: String,
}

/// Resolves URL patterns against the remote index service.
#[derive(Debug, Clone)]
pub struct IndexLocator {
    http: HttpClient,
    server: String,
    retry: RetryPolicy,
}

impl IndexLocator {
    /// `server` is the index root including the trailing slash, e.g. `http://index.commoncrawl.org/`.
    pub fn new(http: HttpClient, server: impl Into<String>) -> Self {
        let mut server = server.into();
        if !server.ends_with('/') {
            server.push('/');
        }
        Self {
            http,
            server,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Construct the query URL for a pattern against one index.
    pub fn build_query_url(server: &str, index_name: &str, pattern: &str) -> String {
        format!(
            "{}{}-index?url={}&output=json",
            server,
            index_name,
            urlencoding::encode(pattern)
        )
    }

    /// Every capture matching `pattern` in `index_name`, in service order.
    ///
    /// Transient failures are retried under the configured policy; an exhausted or permanent
    /// failure is returned for this index only.
    #[tracing::instrument(skip(self), fields(server = %self.server))]
    pub async fn locate(
        &self,
        pattern: &str,
        index_name: &str,
    ) -> Result<Vec<IndexRecord>, LocatorError> {
        let url = Self::build_query_url(&self.server, index_name, pattern);
        let url = url.as_str();

        let result = self
            .retry
            .run(move |_| self.query_once(url), LocatorError::retryable)
            .await;

        match &result {
            Ok(records) => tracing::info!(
                count = records.len(),
                "found records matching pattern"
            ),
            Err(e) => tracing::error!(error = %e, "index query failed"),
        }

        result
    }

    /// Ids of all crawls published by the index server, newest first as served.
    pub async fn list_indexes(&self) -> Result<Vec<String>, LocatorError> {
        let url = format!("{}collinfo.json", self.server);
        let url = url.as_str();
        let http = &self.http;

        self.retry
            .run(
                move |_| async move {
                    let result = http.fetch_bytes(url).await?;
                    validate_http_status(result.status_code, "Collection info")?;
                    let collections: Vec<CollectionInfo> =
                        serde_json::from_slice(&result.content)?;
                    Ok(collections.into_iter().map(|c| c.id).collect())
                },
                LocatorError::retryable,
            )
            .await
    }

    async fn query_once(&self, url: &str) -> Result<Vec<IndexRecord>, LocatorError> {
        let response = self.http.fetch_stream(url).await?;
        let status = response.status().as_u16();
        // The index service answers 404 "No Captures found" for a pattern with no matches.
        if status == 404 {
            tracing::info!(url, "no captures found");
            return Ok(Vec::new());
        }
        validate_http_status(status, "Index")?;

        let body_stream = response.bytes_stream().map_err(std::io::Error::other);
        let stream_reader = tokio_util::io::StreamReader::new(body_stream);
        let mut reader = Box::pin(BufReader::new(stream_reader));

        let mut records = Vec::new();
        let mut line_buffer = Vec::new();
        let mut line_count = 0usize;

        loop {
            line_buffer.clear();
            let bytes_read = reader.read_until(b'\n', &mut line_buffer).await?;
            if bytes_read == 0 {
                break;
            }
            line_count += 1;

            if line_buffer.len() > MAX_LINE_SIZE {
                return Err(LocatorError::Data(format!(
                    "line {} exceeds {} bytes",
                    line_count, MAX_LINE_SIZE
                )));
            }

            strip_line_endings(&mut line_buffer);
            if line_buffer.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            records.push(parse_index_line(&line_buffer).map_err(|e| {
                LocatorError::Data(format!("line {}: {}", line_count, e))
            })?);
        }

        Ok(records)
    }
}

/// Parse one line of the newline-delimited index response.
pub fn parse_index_line(line: &[u8]) -> Result<IndexRecord, LocatorError> {
    let record: IndexRecord = serde_json::from_slice(line)?;
    if record.url.is_empty() {
        return Err(LocatorError::Data("Missing url field".to_string()));
    }
    if record.filename.is_empty() {
        return Err(LocatorError::Data("Missing filename field".to_string()));
    }
    Ok(record)
}

fn validate_http_status(status: u16, context: &str) -> Result<(), LocatorError> {
    if status == 200 {
        Ok(())
    } else if status >= 500 {
        Err(LocatorError::Http(status, format!("{} server error", context)))
    } else if status >= 400 {
        Err(LocatorError::Http(status, format!("{} client error", context)))
    } else {
        Err(LocatorError::Http(status, format!("{} unexpected status", context)))
    }
}

fn strip_line_endings(line_buffer: &mut Vec<u8>) {
    while line_buffer.last() == Some(&b'\n') || line_buffer.last() == Some(&b'\r') {
        line_buffer.pop();
    }
}
