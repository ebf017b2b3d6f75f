//! Byte-range retrieval of a single archive record and extraction of its document payload.
//!
//! A record is stored as an independent gzip member, so the requested range decompresses on
//! its own. Inside it sits an envelope header block, a blank line, the captured protocol
//! response headers, another blank line, and finally the document body.

use crate::network::{FetchError, HttpClient};
use flate2::read::MultiGzDecoder;
use std::io::Read;

const SEPARATOR_CRLF: &str = "\r\n\r\n";
const SEPARATOR_LF: &str = "\n\n";

#[derive(Debug, thiserror::Error)]
pub enum RangeError {
    #[error("Invalid input parameters: {0}")]
    InvalidInput(String),

    #[error("Unexpected status code: {0}")]
    UnexpectedStatus(u16),

    #[error("Download failed: {0}")]
    Download(#[from] FetchError),

    #[error("Decompression failed: {0}")]
    Decompression(String),
}

impl RangeError {
    pub fn retryable(&self) -> bool {
        match self {
            RangeError::Download(e) => e.is_retryable(),
            RangeError::UnexpectedStatus(code) => matches!(code, 408 | 429 | 500..=599),
            RangeError::InvalidInput(_) | RangeError::Decompression(_) => false,
        }
    }
}

/// Fetches byte ranges from archive storage.
#[derive(Debug, Clone)]
pub struct RangeFetcher {
    http: HttpClient,
}

impl RangeFetcher {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Download `[offset, offset + length - 1]`, gunzip it and return the document payload.
    ///
    /// `Ok(None)` means the record decompressed but its framing held no payload.
    pub async fn fetch_payload(
        &self,
        archive_url: &str,
        offset: u64,
        length: u64,
    ) -> Result<Option<String>, RangeError> {
        let record = self.fetch_record(archive_url, offset, length).await?;
        Ok(extract_payload(&record).map(str::to_string))
    }

    /// Download and gunzip one range, returning the whole decompressed record.
    pub async fn fetch_record(
        &self,
        archive_url: &str,
        offset: u64,
        length: u64,
    ) -> Result<String, RangeError> {
        if archive_url.is_empty() {
            return Err(RangeError::InvalidInput("empty archive url".to_string()));
        }
        if length < 1 {
            return Err(RangeError::InvalidInput(format!(
                "length must be at least 1, got {}",
                length
            )));
        }

        let result = self.http.fetch_range(archive_url, offset, length).await?;

        // Partial content is the only acceptable answer; a 200 would be the whole archive.
        if result.status_code != 206 {
            return Err(RangeError::UnexpectedStatus(result.status_code));
        }

        gunzip(&result.content)
    }
}

/// Decompress a gzip body into UTF-8 text.
pub fn gunzip(compressed: &[u8]) -> Result<String, RangeError> {
    let mut decoder = MultiGzDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| RangeError::Decompression(e.to_string()))?;

    String::from_utf8(raw).map_err(|e| RangeError::Decompression(e.to_string()))
}

/// Strip the envelope and protocol header blocks, returning the payload that follows the
/// second blank line. `None` if either separator is missing.
pub fn extract_payload(record: &str) -> Option<&str> {
    let (_, response) = split_block(record)?;
    let (_, payload) = split_block(response)?;
    Some(payload)
}

// The block ends at whichever blank line comes first.
fn split_block(text: &str) -> Option<(&str, &str)> {
    let crlf = text.find(SEPARATOR_CRLF).map(|pos| (pos, SEPARATOR_CRLF.len()));
    let lf = text.find(SEPARATOR_LF).map(|pos| (pos, SEPARATOR_LF.len()));
    let (pos, len) = [crlf, lf].into_iter().flatten().min_by_key(|&(pos, _)| pos)?;
    Some((&text[..pos], &text[pos + len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_extract_payload_two_layers() {
        let record = "WARC/1.0\r\nWARC-Type: response\r\n\r\nHTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html>hola</html>";
        assert_eq!(extract_payload(record), Some("<html>hola</html>"));
    }

    #[test]
    fn test_extract_payload_keeps_later_blank_lines() {
        let record = "WARC/1.0\r\n\r\nHTTP/1.1 200 OK\r\n\r\n<p>a</p>\r\n\r\n<p>b</p>";
        assert_eq!(extract_payload(record), Some("<p>a</p>\r\n\r\n<p>b</p>"));
    }

    #[test]
    fn test_extract_payload_bare_lf_headers_with_crlf_body() {
        let record = "WARC/1.0\nWARC-Type: response\n\nHTTP/1.1 200 OK\nContent-Type: text/html\n\n<p>a</p>\r\n\r\n<p>b</p>";
        assert_eq!(extract_payload(record), Some("<p>a</p>\r\n\r\n<p>b</p>"));
    }

    #[test]
    fn test_extract_payload_missing_second_separator() {
        let record = "WARC/1.0\r\nWARC-Type: response\r\n\r\nHTTP/1.1 200 OK\r\nContent-Type: text/html";
        assert_eq!(extract_payload(record), None);
    }

    #[test]
    fn test_extract_payload_missing_both_separators() {
        assert_eq!(extract_payload("WARC/1.0\r\nWARC-Type: response"), None);
    }

    #[test]
    fn test_gunzip_roundtrip_and_garbage() {
        assert_eq!(gunzip(&gzip("hello")).unwrap(), "hello");
        assert!(matches!(
            gunzip(b"definitely not gzip"),
            Err(RangeError::Decompression(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_length_is_invalid_input() {
        let http = HttpClient::new("TestBot/1.0".to_string(), 5).unwrap();
        let fetcher = RangeFetcher::new(http);
        let result = fetcher.fetch_payload("http://localhost/x.warc.gz", 0, 0).await;
        assert!(matches!(result, Err(RangeError::InvalidInput(_))));
    }
}
