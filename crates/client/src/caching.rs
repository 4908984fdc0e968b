//! Cache-aware fetching.
//!
//! [`CachingFetcher`] puts a [`Cache`] in front of an [`HttpFetcher`]:
//!
//! - miss: fetch, store a `200`, return it
//! - fresh hit: serve the cached copy without touching the network
//! - stale hit: send a conditional GET; `304` refreshes and serves the
//!   cached copy, `200` replaces it
//!
//! Cache calls touch the disk and may wait on entry locks, so they run on
//! the blocking pool. Cache failures never fail a fetch; they are logged
//! and the request goes to the network uncached.

use crate::fetch::{FetchResponse, HttpFetcher, canonicalize};
use bytes::Bytes;
use dapcache_core::cache::{is_cacheable_url, now};
use dapcache_core::{Cache, CacheConfig, DisconnectedMode, Error};
use std::sync::Arc;
use url::Url;

/// Where a response handed out by [`CachingFetcher`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Fetched from the server.
    Network,
    /// Served from the cache without contacting the server.
    Cache,
    /// Served from the cache after the server answered `304 Not Modified`.
    Revalidated,
}

/// A response returned by [`CachingFetcher::fetch`].
#[derive(Debug, Clone)]
pub struct CachedFetch {
    pub url: Url,
    /// `200` for cached copies, `304` for revalidated ones, the server's
    /// status otherwise.
    pub status: u16,
    pub headers: Vec<String>,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl CachedFetch {
    fn from_network(response: FetchResponse) -> Self {
        Self {
            url: response.url,
            status: response.status,
            headers: response.headers,
            body: response.body,
            source: ResponseSource::Network,
        }
    }

    /// Whether the body came out of the cache.
    pub fn from_cache(&self) -> bool {
        self.source != ResponseSource::Network
    }

    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

enum Lookup {
    Miss,
    Fresh(CachedFetch),
    Stale,
}

/// Run a cache operation on the blocking pool.
async fn blocking<T, F>(cache: &Arc<Cache>, f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&Cache) -> Result<T, Error> + Send + 'static,
{
    let cache = Arc::clone(cache);
    tokio::task::spawn_blocking(move || f(&cache))
        .await
        .map_err(|e| Error::Internal(format!("cache task failed: {e}")))?
}

/// Log a cache failure the fetch recovers from. Broken checkout protocol is
/// logged louder than runtime conditions such as I/O errors.
fn log_cache_error(url: &Url, e: &Error, message: &str) {
    if e.is_precondition() {
        tracing::error!(url = %url, error = %e, "{}", message);
    } else {
        tracing::warn!(url = %url, error = %e, "{}", message);
    }
}

/// Check out, read and release the cached copy of `url`.
fn read_cached(cache: &Cache, url: &Url, source: ResponseSource) -> Result<Option<CachedFetch>, Error> {
    let mut response = match cache.get_cached_response(url.as_str()) {
        Ok(response) => response,
        Err(Error::CacheMiss(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let body = response.read_body()?;
    let headers = response.headers().to_vec();
    cache.release_cached_response(response);

    Ok(Some(CachedFetch { url: url.clone(), status: 200, headers, body: Bytes::from(body), source }))
}

/// An [`HttpFetcher`] with an optional response cache in front of it.
pub struct CachingFetcher<F> {
    fetcher: F,
    cache: Option<Arc<Cache>>,
}

impl<F: HttpFetcher> CachingFetcher<F> {
    pub fn new(fetcher: F, cache: Option<Arc<Cache>>) -> Self {
        Self { fetcher, cache }
    }

    /// Use the process-wide cache for `config`, or no cache at all if it
    /// cannot be opened.
    pub fn from_config(fetcher: F, config: &CacheConfig) -> Self {
        let cache = match Cache::instance(config) {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(root = %config.cache_root.display(), error = %e, "cache unavailable, caching disabled");
                None
            }
        };
        Self { fetcher, cache }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    /// Fetch `url`, using and maintaining the cache.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidUrl`] for URLs that are not http(s),
    /// [`Error::HttpError`] for transport failures and statuses `>= 400`,
    /// [`Error::UnexpectedStatus`] when revalidation gets neither `200` nor
    /// `304`, and [`Error::Disconnected`] for a miss in
    /// [`DisconnectedMode::Normal`].
    pub async fn fetch(&self, url: &str) -> Result<CachedFetch, Error> {
        let url = canonicalize(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let Some(cache) = self.usable_cache(&url) else {
            return self.plain_fetch(&url).await;
        };

        match cache.get_disconnected_mode() {
            DisconnectedMode::None => self.caching_fetch(cache, &url).await,
            mode => self.disconnected_fetch(cache, &url, mode).await,
        }
    }

    fn usable_cache(&self, url: &Url) -> Option<&Arc<Cache>> {
        self.cache
            .as_ref()
            .filter(|cache| cache.is_cache_enabled() && is_cacheable_url(url.as_str(), cache.get_cache_protected()))
    }

    async fn caching_fetch(&self, cache: &Arc<Cache>, url: &Url) -> Result<CachedFetch, Error> {
        let key = url.clone();
        let lookup = blocking(cache, move |c| match c.is_valid(key.as_str()) {
            Ok(true) => Ok(read_cached(c, &key, ResponseSource::Cache)?.map_or(Lookup::Miss, Lookup::Fresh)),
            Ok(false) => Ok(Lookup::Stale),
            Err(Error::CacheMiss(_)) => Ok(Lookup::Miss),
            Err(e) => Err(e),
        })
        .await;

        match lookup {
            Ok(Lookup::Fresh(cached)) => {
                tracing::debug!("serving {} from cache", url);
                Ok(cached)
            }
            Ok(Lookup::Miss) => self.fetch_and_store(cache, url).await,
            Ok(Lookup::Stale) => self.revalidate(cache, url).await,
            Err(e) => {
                log_cache_error(url, &e, "cache lookup failed, fetching uncached");
                self.plain_fetch(url).await
            }
        }
    }

    async fn disconnected_fetch(
        &self, cache: &Arc<Cache>, url: &Url, mode: DisconnectedMode,
    ) -> Result<CachedFetch, Error> {
        let key = url.clone();
        let cached = match blocking(cache, move |c| read_cached(c, &key, ResponseSource::Cache)).await {
            Ok(cached) => cached,
            Err(e) => {
                log_cache_error(url, &e, "cache read failed while disconnected");
                None
            }
        };

        match (cached, mode) {
            (Some(cached), _) => Ok(cached),
            (None, DisconnectedMode::Normal) => Err(Error::Disconnected(url.to_string())),
            (None, _) => self.fetch_and_store(cache, url).await,
        }
    }

    async fn revalidate(&self, cache: &Arc<Cache>, url: &Url) -> Result<CachedFetch, Error> {
        let key = url.to_string();
        let conditional = match blocking(cache, move |c| c.get_conditional_request_headers(&key)).await {
            Ok(headers) => headers,
            Err(Error::CacheMiss(_)) => return self.fetch_and_store(cache, url).await,
            Err(e) => {
                log_cache_error(url, &e, "cannot build conditional request, fetching uncached");
                return self.plain_fetch(url).await;
            }
        };

        let request_time = now();
        let response = self.fetcher.fetch(url, &conditional).await?;

        match response.status {
            200 => {
                self.store(cache, url, request_time, &response).await;
                Ok(CachedFetch::from_network(response))
            }
            304 => {
                let key = url.clone();
                let headers = response.headers;
                let refreshed = blocking(cache, move |c| match c.update_response(key.as_str(), request_time, &headers) {
                    Ok(()) => read_cached(c, &key, ResponseSource::Revalidated),
                    Err(Error::CacheMiss(_)) => Ok(None),
                    Err(e) => Err(e),
                })
                .await;

                match refreshed {
                    Ok(Some(mut cached)) => {
                        tracing::debug!("revalidated {}", url);
                        cached.status = 304;
                        Ok(cached)
                    }
                    Ok(None) => {
                        tracing::debug!("{} left the cache during revalidation", url);
                        self.fetch_and_store(cache, url).await
                    }
                    Err(e) => {
                        log_cache_error(url, &e, "cache update failed, fetching uncached");
                        self.plain_fetch(url).await
                    }
                }
            }
            status if status >= 400 => Err(Error::HttpError(format!("status {status}"))),
            status => Err(Error::UnexpectedStatus(status)),
        }
    }

    async fn fetch_and_store(&self, cache: &Arc<Cache>, url: &Url) -> Result<CachedFetch, Error> {
        let request_time = now();
        let response = self.checked_fetch(url).await?;
        if response.status == 200 {
            self.store(cache, url, request_time, &response).await;
        }
        Ok(CachedFetch::from_network(response))
    }

    async fn plain_fetch(&self, url: &Url) -> Result<CachedFetch, Error> {
        Ok(CachedFetch::from_network(self.checked_fetch(url).await?))
    }

    async fn checked_fetch(&self, url: &Url) -> Result<FetchResponse, Error> {
        let response = self.fetcher.fetch(url, &[]).await?;
        if response.status >= 400 {
            return Err(Error::HttpError(format!("status {}", response.status)));
        }
        Ok(response)
    }

    async fn store(&self, cache: &Arc<Cache>, url: &Url, request_time: i64, response: &FetchResponse) {
        let key = url.to_string();
        let headers = response.headers.clone();
        let body = response.body.clone();

        match blocking(cache, move |c| c.store(&key, request_time, &headers, body.as_ref())).await {
            Ok(true) => tracing::debug!("cached {}", url),
            Ok(false) => tracing::debug!("{} not cacheable", url),
            Err(e) => log_cache_error(url, &e, "failed to cache response"),
        }
    }
}
