//! HTTP fetch layer underneath the response cache.
//!
//! ### URL Canonicalization
//! - Trim whitespace, require `http`/`https`
//! - Lowercase host, remove fragments
//! - Preserve query string
//!
//! ### Transport
//! - Extra request headers are passed as raw `Name: value` lines, which is
//!   how conditional requests built by the cache reach the server
//! - Non-2xx statuses are returned, not raised; the caching layer decides
//! - Max redirects: 5
//! - Max body bytes: 16MB (configurable)

pub mod url;

use bytes::Bytes;
use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, header};
use std::time::{Duration, Instant};

pub use url::{UrlError, canonicalize, has_credentials};

use dapcache_core::Error;

/// Configuration for the fetch client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "dapcache/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 16MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "dapcache/0.1".to_string(),
            max_bytes: 16 * 1024 * 1024,
            timeout: Duration::from_millis(20000),
            max_redirects: 5,
        }
    }
}

/// Response from a fetch operation.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// The URL requested
    pub url: Url,
    /// HTTP status code
    pub status: u16,
    /// Response headers as `Name: value` lines
    pub headers: Vec<String>,
    /// Response body bytes
    pub body: Bytes,
    /// Time taken to fetch in milliseconds
    pub fetch_ms: u64,
}

impl FetchResponse {
    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

/// Something that can perform a single HTTP GET.
#[async_trait::async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetch `url`, sending `extra_headers` (raw `Name: value` lines) with the request.
    ///
    /// Any status the server answers with is returned as a response; only
    /// transport failures are errors.
    async fn fetch(&self, url: &Url, extra_headers: &[String]) -> Result<FetchResponse, Error>;
}

/// [`HttpFetcher`] backed by reqwest.
pub struct ReqwestFetcher {
    http: Client,
    config: FetchConfig,
}

impl ReqwestFetcher {
    /// Create a new fetch client with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::HttpError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &Url, extra_headers: &[String]) -> Result<FetchResponse, Error> {
        let start = Instant::now();

        let response = self
            .http
            .get(url.as_str())
            .headers(request_headers(extra_headers)?)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status().as_u16();

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::FetchTooLarge(format!(
                "{} bytes exceeds {}",
                len, self.config.max_bytes
            )));
        }

        let headers = header_lines(response.headers());

        let body = response.bytes().await.map_err(|e| transport_error(&e))?;

        if body.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!(
                "{} bytes exceeds {}",
                body.len(),
                self.config.max_bytes
            )));
        }

        let fetch_ms = start.elapsed().as_millis() as u64;

        tracing::debug!("fetched {} -> {} in {}ms ({} bytes)", url, status, fetch_ms, body.len());

        Ok(FetchResponse { url: url.clone(), status, headers, body, fetch_ms })
    }
}

fn transport_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::FetchTimeout(e.to_string())
    } else {
        Error::HttpError(format!("network error: {}", e))
    }
}

/// Convert raw `Name: value` lines into a header map.
fn request_headers(lines: &[String]) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("not a header line: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| Error::InvalidInput(format!("bad header name in {line:?}: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| Error::InvalidInput(format!("bad header value in {line:?}: {e}")))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Flatten a header map into `Name: value` lines, skipping values that are not visible ASCII.
fn header_lines(headers: &header::HeaderMap) -> Vec<String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| format!("{}: {}", name.as_str(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_config_default() {
        let config = FetchConfig::default();
        assert_eq!(config.user_agent, "dapcache/0.1");
        assert_eq!(config.max_bytes, 16 * 1024 * 1024);
        assert_eq!(config.timeout, Duration::from_millis(20000));
        assert_eq!(config.max_redirects, 5);
    }

    #[test]
    fn test_fetch_response_header_lookup() {
        let response = FetchResponse {
            url: Url::parse("http://example.com/a.dds").unwrap(),
            status: 200,
            headers: vec!["content-type: text/plain".to_string(), "ETag: \"v1\"".to_string()],
            body: Bytes::new(),
            fetch_ms: 100,
        };

        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.header("etag"), Some("\"v1\""));
        assert_eq!(response.header("Last-Modified"), None);
    }

    #[test]
    fn test_request_headers_parse() {
        let map = request_headers(&[
            "If-None-Match: \"abc\"".to_string(),
            "If-Modified-Since: Sun, 06 Nov 1994 08:49:37 GMT".to_string(),
        ])
        .unwrap();
        assert_eq!(map.get("if-none-match").unwrap(), "\"abc\"");
        assert_eq!(map.get("if-modified-since").unwrap(), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_request_headers_reject_garbage() {
        assert!(matches!(
            request_headers(&["no colon here".to_string()]),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            request_headers(&["bad name: x".to_string()]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_header_lines() {
        let mut map = HeaderMap::new();
        map.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        map.append(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        let lines = header_lines(&map);
        assert!(lines.contains(&"content-length: 12".to_string()));
        assert!(lines.contains(&"cache-control: max-age=60".to_string()));
    }

    #[tokio::test]
    async fn test_reqwest_fetcher_new() {
        let config = FetchConfig { max_bytes: 1024, ..Default::default() };
        let fetcher = ReqwestFetcher::new(config).unwrap();
        assert_eq!(fetcher.config().max_bytes, 1024);
    }
}
