//! Tunable cache policy.

use super::freshness::RequestControl;
use super::gc::GcBudget;
use crate::config::{CacheConfig, MAX_CACHE_SIZE_MB, MEGABYTE, MIN_CACHE_SIZE_MB};
use serde::{Deserialize, Serialize};

/// How the cache treats the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectedMode {
    /// Normal operation: validate and fetch as HTTP requires.
    #[default]
    None,
    /// Serve cached copies without validation and never fetch.
    Normal,
    /// Serve cached copies without validation but fetch on a miss.
    External,
}

/// The live policy of one [`Cache`](super::Cache).
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub enabled: bool,
    pub total_size: u64,
    pub folder_size: u64,
    pub gc_buffer: u64,
    pub max_entry_size: u64,
    pub default_expiration: i64,
    pub always_validate: bool,
    pub expire_ignored: bool,
    pub cache_protected: bool,
    pub disconnected: DisconnectedMode,
    pub dump_frequency: u32,
    pub request: RequestControl,
    /// The request `Cache-Control` lines `request` was parsed from.
    pub cache_control: Vec<String>,
}

impl CachePolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut policy = Self {
            enabled: config.enabled,
            total_size: 0,
            folder_size: 0,
            gc_buffer: 0,
            max_entry_size: config.max_entry_size(),
            default_expiration: config.default_expiration_secs,
            always_validate: config.always_validate,
            expire_ignored: config.expire_ignored,
            cache_protected: config.cache_protected,
            disconnected: config.disconnected,
            dump_frequency: config.dump_frequency,
            request: RequestControl::default(),
            cache_control: Vec::new(),
        };
        policy.set_max_size_mb(config.max_size_mb);
        policy
    }

    /// Set the total size, at least 5MB and at most what a `u64` byte count
    /// holds. A tenth is reserved for directories and another tenth is the
    /// collection buffer.
    pub fn set_max_size_mb(&mut self, size_mb: u64) {
        let total = size_mb.clamp(MIN_CACHE_SIZE_MB, MAX_CACHE_SIZE_MB) * MEGABYTE;
        self.total_size = total;
        self.folder_size = total / 10;
        self.gc_buffer = total / 10;
    }

    /// Set the per-entry limit. Sizes of zero or that do not fit in the
    /// cache are rejected and leave the limit unchanged.
    pub fn set_max_entry_size_mb(&mut self, size_mb: u64) -> bool {
        let Some(size) = size_mb.checked_mul(MEGABYTE) else {
            return false;
        };
        if size == 0 || size >= self.total_size - self.folder_size {
            return false;
        }
        self.max_entry_size = size;
        true
    }

    pub fn budget(&self) -> GcBudget {
        GcBudget {
            total_size: self.total_size,
            folder_size: self.folder_size,
            gc_buffer: self.gc_buffer,
            max_entry_size: self.max_entry_size,
        }
    }
}
