//! HTTP range client: capability probing and byte-range fetches.
//!
//! The client holds no per-download state and never retries; that is the
//! job of the segment fetcher and the engine. It is designed to be created
//! once and cloned, sharing one connection pool.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::{
    CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, IF_RANGE, LAST_MODIFIED, RANGE, RETRY_AFTER,
};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// Identifies one version of a remote resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// `ETag` header value, quotes included.
    pub etag: Option<String>,
    /// `Last-Modified` header value.
    pub last_modified: Option<String>,
}

impl Validator {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            etag: read(ETAG),
            last_modified: read(LAST_MODIFIED),
        }
    }

    /// True when neither header was present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Whether `other` describes the same resource version.
    ///
    /// ETags win when both sides have one, then Last-Modified. Two empty
    /// validators match; a validator that appeared or vanished does not.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        match (&self.etag, &other.etag) {
            (Some(a), Some(b)) => return a == b,
            (None, None) => {}
            _ => return false,
        }
        self.last_modified == other.last_modified
    }

    /// Value for an `If-Range` header: a strong ETag, else Last-Modified.
    #[must_use]
    pub fn if_range(&self) -> Option<&str> {
        self.etag
            .as_deref()
            .filter(|etag| !etag.starts_with("W/"))
            .or(self.last_modified.as_deref())
    }
}

/// What a probe learned about a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Server answered a range request with 206.
    pub supports_ranges: bool,
    /// Total size when the server disclosed it.
    pub total_size: Option<u64>,
    /// Version identifiers.
    pub validator: Validator,
}

/// Inclusive-start byte range; `end` is inclusive when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// Last byte; `None` means through the end of the resource.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Range header value, e.g. `bytes=100-199` or `bytes=100-`.
    #[must_use]
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{end}", self.start),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Stream of body chunks for one fetch.
pub type RangeStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// HTTP client for probing and ranged fetching.
///
/// # Example
///
/// ```no_run
/// use splitfetch_core::download::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new()?;
/// let probe = client.probe("https://example.com/image.iso").await?;
/// println!("ranges: {}, size: {:?}", probe.supports_ranges, probe.total_size);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with default timeouts.
    ///
    /// Transparent decompression stays off: ranges address encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns the builder error if TLS or proxy configuration fails.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit connect and per-read timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder error if TLS or proxy configuration fails.
    pub fn new_with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self { client })
    }

    /// Discovers range support, size and validator with a one-byte range GET.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl`, `Network`/`Timeout` or `HttpStatus`.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        let parsed = parse_http_url(url)?;
        let response = self
            .client
            .get(parsed)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        let status = response.status();
        let headers = response.headers();
        let validator = Validator::from_headers(headers);

        let result = match status {
            StatusCode::PARTIAL_CONTENT => ProbeResult {
                supports_ranges: true,
                total_size: headers
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total),
                validator,
            },
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let total = headers
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total);
                if total != Some(0) {
                    return Err(DownloadError::RangeNotSatisfiable {
                        url: url.to_string(),
                    });
                }
                ProbeResult {
                    supports_ranges: true,
                    total_size: Some(0),
                    validator,
                }
            }
            status if status.is_success() => ProbeResult {
                supports_ranges: false,
                total_size: content_length(headers),
                validator,
            },
            _ => return Err(status_error(url, &response)),
        };

        debug!(
            supports_ranges = result.supports_ranges,
            total_size = ?result.total_size,
            etag = ?result.validator.etag,
            "probe complete"
        );
        Ok(result)
    }

    /// Opens a body stream for `range`, or for the whole resource when `range` is `None`.
    ///
    /// With a range, `If-Range` carries the expected validator so a changed
    /// resource comes back as a full 200 instead of a mismatched slice.
    ///
    /// # Errors
    ///
    /// - `RangeNotSatisfiable` on 416
    /// - `ResourceChanged` on 412, on 200 for a range not starting at zero,
    ///   or when the response validator differs from `expected`
    /// - `HttpStatus`, `Network`/`Timeout`, `InvalidUrl` otherwise
    #[instrument(skip(self, expected), fields(url = %url, range = ?range))]
    pub async fn fetch(
        &self,
        url: &str,
        range: Option<ByteRange>,
        expected: &Validator,
    ) -> Result<RangeStream, DownloadError> {
        let parsed = parse_http_url(url)?;
        let mut request = self.client.get(parsed);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
            if let Some(if_range) = expected.if_range() {
                request = request.header(IF_RANGE, if_range);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        match response.status() {
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(DownloadError::RangeNotSatisfiable {
                    url: url.to_string(),
                });
            }
            StatusCode::PRECONDITION_FAILED => {
                return Err(DownloadError::resource_changed(url, "precondition failed"));
            }
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                if range.is_some_and(|r| r.start > 0) {
                    return Err(DownloadError::resource_changed(
                        url,
                        "server ignored the range request",
                    ));
                }
            }
            status if status.is_success() => {}
            _ => return Err(status_error(url, &response)),
        }

        let received = Validator::from_headers(response.headers());
        if !expected.is_empty() && !received.is_empty() && !expected.matches(&received) {
            return Err(DownloadError::resource_changed(url, "validator changed"));
        }

        let stream_url = url.to_string();
        Ok(response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| DownloadError::network(stream_url.clone(), e)))
            .boxed())
    }
}

pub(crate) fn parse_http_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DownloadError::invalid_url(url));
    }
    Ok(parsed)
}

fn status_error(url: &str, response: &Response) -> DownloadError {
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    DownloadError::http_status_with_retry_after(url, response.status().as_u16(), retry_after)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Extracts the complete length from `bytes 0-0/1234` or `bytes */1234`.
///
/// Returns `None` for an unknown length (`/*`) or a malformed header.
#[must_use]
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(mut stream: RangeStream) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        body
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes */0"), Some(0));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("items 0-0/5"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_byte_range_header_value() {
        let closed = ByteRange {
            start: 10,
            end: Some(19),
        };
        let open = ByteRange {
            start: 10,
            end: None,
        };
        assert_eq!(closed.header_value(), "bytes=10-19");
        assert_eq!(open.header_value(), "bytes=10-");
    }

    #[test]
    fn test_validator_matching() {
        let a = Validator {
            etag: Some("\"v1\"".into()),
            last_modified: None,
        };
        let b = Validator {
            etag: Some("\"v2\"".into()),
            last_modified: None,
        };
        assert!(a.matches(&a.clone()));
        assert!(!a.matches(&b));
        assert!(!a.matches(&Validator::default()));
        assert!(Validator::default().matches(&Validator::default()));

        let dated = Validator {
            etag: None,
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".into()),
        };
        assert!(dated.matches(&dated.clone()));
    }

    #[test]
    fn test_if_range_skips_weak_etag() {
        let weak = Validator {
            etag: Some("W/\"v1\"".into()),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".into()),
        };
        assert_eq!(weak.if_range(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));

        let strong = Validator {
            etag: Some("\"v1\"".into()),
            last_modified: None,
        };
        assert_eq!(strong.if_range(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_probe_detects_range_support() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("range", "bytes=0-0"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-0/5000")
                    .insert_header("etag", "\"abc\"")
                    .set_body_bytes(vec![0u8]),
            )
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let probe = client
            .probe(&format!("{}/file.bin", server.uri()))
            .await
            .unwrap();

        assert!(probe.supports_ranges);
        assert_eq!(probe.total_size, Some(5000));
        assert_eq!(probe.validator.etag.as_deref(), Some("\"abc\""));
    }

    #[tokio::test]
    async fn test_probe_without_range_support_uses_content_length() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/plain.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 300]))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let probe = client
            .probe(&format!("{}/plain.bin", server.uri()))
            .await
            .unwrap();

        assert!(!probe.supports_ranges);
        assert_eq!(probe.total_size, Some(300));
    }

    #[tokio::test]
    async fn test_probe_empty_resource() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */0"))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let probe = client.probe(&server.uri()).await.unwrap();
        assert_eq!(probe.total_size, Some(0));
    }

    #[tokio::test]
    async fn test_probe_404_is_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let err = client.probe(&server.uri()).await.unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_probe_rejects_non_http_scheme() {
        let client = HttpClient::new().unwrap();
        let err = client.probe("ftp://example.com/file").await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_fetch_sends_range_and_if_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=10-14"))
            .and(header("if-range", "\"abc\""))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("etag", "\"abc\"")
                    .set_body_bytes(b"hello".to_vec()),
            )
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let expected = Validator {
            etag: Some("\"abc\"".into()),
            last_modified: None,
        };
        let stream = client
            .fetch(
                &server.uri(),
                Some(ByteRange {
                    start: 10,
                    end: Some(14),
                }),
                &expected,
            )
            .await
            .unwrap();

        assert_eq!(collect(stream).await, b"hello");
    }

    #[tokio::test]
    async fn test_fetch_full_body_for_offset_range_is_resource_changed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 20]))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let result = client
            .fetch(
                &server.uri(),
                Some(ByteRange {
                    start: 5,
                    end: Some(9),
                }),
                &Validator::default(),
            )
            .await;

        assert!(matches!(result, Err(DownloadError::ResourceChanged { .. })));
    }

    #[tokio::test]
    async fn test_fetch_etag_mismatch_is_resource_changed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("etag", "\"new\"")
                    .set_body_bytes(vec![1u8; 5]),
            )
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let expected = Validator {
            etag: Some("\"old\"".into()),
            last_modified: None,
        };
        let result = client
            .fetch(
                &server.uri(),
                Some(ByteRange {
                    start: 0,
                    end: Some(4),
                }),
                &expected,
            )
            .await;

        assert!(matches!(result, Err(DownloadError::ResourceChanged { .. })));
    }

    #[tokio::test]
    async fn test_fetch_416_is_range_not_satisfiable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let result = client
            .fetch(
                &server.uri(),
                Some(ByteRange {
                    start: 100,
                    end: None,
                }),
                &Validator::default(),
            )
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::RangeNotSatisfiable { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_503_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let result = client.fetch(&server.uri(), None, &Validator::default()).await;

        match result {
            Err(DownloadError::HttpStatus {
                status,
                retry_after,
                ..
            }) => {
                assert_eq!(status, 503);
                assert_eq!(retry_after.as_deref(), Some("3"));
            }
            _ => panic!("expected HttpStatus error"),
        }
    }
}
