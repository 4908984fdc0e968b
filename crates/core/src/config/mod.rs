//! Cache configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (DAP_CACHE_*)
//! 2. TOML config file (if DAP_CACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::cache::DisconnectedMode;

mod validation;

pub use validation::ConfigError;

/// Bytes per megabyte for the size settings.
pub const MEGABYTE: u64 = 1024 * 1024;

/// Smallest total cache size accepted, in megabytes.
pub const MIN_CACHE_SIZE_MB: u64 = 5;

/// Largest total cache size whose byte count fits in a `u64`, in megabytes.
pub const MAX_CACHE_SIZE_MB: u64 = u64::MAX / MEGABYTE;

/// Cache configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (DAP_CACHE_*)
/// 2. TOML config file (if DAP_CACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the index, lock file and cached responses.
    ///
    /// Set via DAP_CACHE_CACHE_ROOT environment variable.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Whether responses are cached at all.
    ///
    /// Set via DAP_CACHE_ENABLED environment variable.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Total size of the cache in megabytes.
    ///
    /// Set via DAP_CACHE_MAX_SIZE_MB environment variable.
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    /// Largest single response that is cached, in megabytes.
    ///
    /// Set via DAP_CACHE_MAX_ENTRY_SIZE_MB environment variable.
    #[serde(default = "default_max_entry_size_mb")]
    pub max_entry_size_mb: u64,

    /// Freshness lifetime for responses without any expiration information.
    ///
    /// Set via DAP_CACHE_DEFAULT_EXPIRATION_SECS environment variable.
    #[serde(default = "default_expiration_secs")]
    pub default_expiration_secs: i64,

    /// Revalidate every cached response before using it.
    #[serde(default)]
    pub always_validate: bool,

    /// Skip the expiration pass during garbage collection.
    #[serde(default)]
    pub expire_ignored: bool,

    /// Cache responses to requests that carried credentials.
    #[serde(default)]
    pub cache_protected: bool,

    /// How the cache behaves when the network should not be used.
    ///
    /// Set via DAP_CACHE_DISCONNECTED environment variable (`none`, `normal`, `external`).
    #[serde(default)]
    pub disconnected: DisconnectedMode,

    /// Number of new entries after which the index is written.
    #[serde(default = "default_dump_frequency")]
    pub dump_frequency: u32,
}

fn default_cache_root() -> PathBuf {
    std::env::temp_dir().join("dods-cache")
}

fn default_true() -> bool {
    true
}

fn default_max_size_mb() -> u64 {
    20
}

fn default_max_entry_size_mb() -> u64 {
    3
}

fn default_expiration_secs() -> i64 {
    86_400 // 24h
}

fn default_dump_frequency() -> u32 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            enabled: true,
            max_size_mb: default_max_size_mb(),
            max_entry_size_mb: default_max_entry_size_mb(),
            default_expiration_secs: default_expiration_secs(),
            always_validate: false,
            expire_ignored: false,
            cache_protected: false,
            disconnected: DisconnectedMode::None,
            dump_frequency: default_dump_frequency(),
        }
    }
}

impl CacheConfig {
    /// A default configuration rooted at `cache_root`.
    pub fn with_root(cache_root: impl Into<PathBuf>) -> Self {
        Self { cache_root: cache_root.into(), ..Default::default() }
    }

    /// Total cache size in bytes.
    pub fn total_size(&self) -> u64 {
        self.max_size_mb.saturating_mul(MEGABYTE)
    }

    /// Per-entry size limit in bytes.
    pub fn max_entry_size(&self) -> u64 {
        self.max_entry_size_mb.saturating_mul(MEGABYTE)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `DAP_CACHE_`
    /// 2. TOML file from `DAP_CACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("DAP_CACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("DAP_CACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_root, std::env::temp_dir().join("dods-cache"));
        assert!(config.enabled);
        assert_eq!(config.max_size_mb, 20);
        assert_eq!(config.max_entry_size_mb, 3);
        assert_eq!(config.default_expiration_secs, 86_400);
        assert!(!config.always_validate);
        assert!(!config.expire_ignored);
        assert!(!config.cache_protected);
        assert_eq!(config.disconnected, DisconnectedMode::None);
        assert_eq!(config.dump_frequency, 10);
    }

    #[test]
    fn test_sizes_in_bytes() {
        let config = CacheConfig::default();
        assert_eq!(config.total_size(), 20 * 1024 * 1024);
        assert_eq!(config.max_entry_size(), 3 * 1024 * 1024);
    }

    #[test]
    fn test_load_layers() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("cache.toml", "max_size_mb = 50\nalways_validate = true\ncache_root = \"/var/cache/dods\"")?;
            jail.set_env("DAP_CACHE_CONFIG_FILE", "cache.toml");
            jail.set_env("DAP_CACHE_MAX_SIZE_MB", "40");
            jail.set_env("DAP_CACHE_DISCONNECTED", "external");

            let config = CacheConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.max_size_mb, 40);
            assert!(config.always_validate);
            assert_eq!(config.cache_root, PathBuf::from("/var/cache/dods"));
            assert_eq!(config.disconnected, DisconnectedMode::External);
            assert_eq!(config.max_entry_size_mb, 3);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DAP_CACHE_MAX_SIZE_MB", "1");
            let result = CacheConfig::load();
            assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_size_mb"));
            Ok(())
        });
    }
}
