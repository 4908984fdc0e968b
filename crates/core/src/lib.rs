//! Core types and shared functionality for dapcache.
//!
//! This crate provides:
//! - A disk-persisted HTTP/1.1 response cache (RFC 2616 §13 freshness and validation)
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{Cache, CacheEntry, CachedResponse, DisconnectedMode};
pub use config::CacheConfig;
pub use error::Error;
