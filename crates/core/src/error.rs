//! Unified error types for dapcache.
//!
//! The variants follow the cache's error taxonomy: initialization failures,
//! I/O failures, precondition violations and protocol/parse errors.

use crate::config::ConfigError;

/// Unified error types for the cache and the caching fetcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., a malformed request header line).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// No cache entry found for the given URL.
    #[error("CACHE_MISS: {0}")]
    CacheMiss(String),

    /// The cache root or its lock file could not be set up.
    #[error("CACHE_INIT: {0}")]
    Init(String),

    /// Reading or writing a body, metadata or index file failed.
    #[error("CACHE_IO: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Tried to remove or replace an entry that is checked out.
    #[error("ENTRY_IN_USE: {0}")]
    EntryInUse(String),

    /// Tried to purge the cache while entries are checked out.
    #[error("CACHE_BUSY: {0} entries are checked out")]
    Busy(usize),

    /// A line of the index file could not be parsed.
    #[error("INDEX_PARSE: line {line}: {reason}")]
    IndexParse { line: usize, reason: String },

    /// An invariant of the in-memory table was broken.
    #[error("CACHE_INTERNAL: {0}")]
    Internal(String),

    /// The cache is disconnected from the network and holds no copy.
    #[error("DISCONNECTED: {0}")]
    Disconnected(String),

    /// HTTP error response.
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),

    /// Revalidation returned a status other than 200 or 304.
    #[error("UNEXPECTED_STATUS: {0}")]
    UnexpectedStatus(u16),

    /// Fetch timeout.
    #[error("FETCH_TIMEOUT: {0}")]
    FetchTimeout(String),

    /// Fetch response too large.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// Configuration could not be loaded or validated.
    #[error("CONFIG_ERROR: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io { context: context.into(), source }
    }

    /// Whether this error is a programmer error (a broken checkout/removal
    /// protocol) rather than a runtime condition.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::EntryInUse(_) | Error::Busy(_) | Error::Internal(_))
    }
}
