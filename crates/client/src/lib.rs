//! Client side of dapcache.
//!
//! This crate provides the HTTP fetch layer and a fetcher that serves,
//! stores and revalidates responses through the dapcache-core cache.

pub mod caching;
pub mod fetch;

pub use caching::{CachedFetch, CachingFetcher, ResponseSource};
pub use fetch::{FetchConfig, FetchResponse, HttpFetcher, ReqwestFetcher};
