//! Configuration validation rules.
//!
//! This module provides validation logic for `CacheConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::{CacheConfig, MAX_CACHE_SIZE_MB, MIN_CACHE_SIZE_MB};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

impl CacheConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `cache_root` is empty or contains whitespace (the index is whitespace-separated)
    /// - `max_size_mb` is below 5MB, or too large to count in bytes
    /// - `max_entry_size_mb` is 0 or does not fit in the cache after the folder reserve
    /// - `default_expiration_secs` is negative
    /// - `dump_frequency` is 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        let root = self.cache_root.to_string_lossy();
        if root.is_empty() {
            return Err(ConfigError::Invalid { field: "cache_root".into(), reason: "must not be empty".into() });
        }
        if root.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid {
                field: "cache_root".into(),
                reason: "must not contain whitespace".into(),
            });
        }

        if self.max_size_mb < MIN_CACHE_SIZE_MB {
            return Err(ConfigError::Invalid {
                field: "max_size_mb".into(),
                reason: format!("must be at least {MIN_CACHE_SIZE_MB}MB"),
            });
        }
        if self.max_size_mb > MAX_CACHE_SIZE_MB {
            return Err(ConfigError::Invalid {
                field: "max_size_mb".into(),
                reason: format!("must be at most {MAX_CACHE_SIZE_MB}MB"),
            });
        }

        let usable = self.total_size() - self.total_size() / 10;
        if self.max_entry_size_mb == 0 {
            return Err(ConfigError::Invalid {
                field: "max_entry_size_mb".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.max_entry_size() >= usable {
            return Err(ConfigError::Invalid {
                field: "max_entry_size_mb".into(),
                reason: "must be smaller than the usable cache size".into(),
            });
        }

        if self.default_expiration_secs < 0 {
            return Err(ConfigError::Invalid {
                field: "default_expiration_secs".into(),
                reason: "must not be negative".into(),
            });
        }

        if self.dump_frequency == 0 {
            return Err(ConfigError::Invalid { field: "dump_frequency".into(), reason: "must be greater than 0".into() });
        }

        if !self.enabled && self.always_validate {
            tracing::warn!("always_validate is set but the cache is disabled");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_cache_root() {
        let config = CacheConfig { cache_root: PathBuf::new(), ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "cache_root"));

        let config = CacheConfig::with_root("/tmp/my cache");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "cache_root"));
    }

    #[test]
    fn test_validate_max_size_too_small() {
        let config = CacheConfig { max_size_mb: 4, max_entry_size_mb: 1, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_size_mb"));
    }

    #[test]
    fn test_validate_sizes_too_large() {
        let config = CacheConfig { max_size_mb: u64::MAX, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "max_size_mb"));

        let config = CacheConfig { max_entry_size_mb: u64::MAX, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "max_entry_size_mb"));

        let config = CacheConfig { max_size_mb: MAX_CACHE_SIZE_MB, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_entry_size() {
        let config = CacheConfig { max_entry_size_mb: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "max_entry_size_mb"));

        // 18MB is exactly the usable part of a 20MB cache
        let config = CacheConfig { max_entry_size_mb: 18, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "max_entry_size_mb"));

        let config = CacheConfig { max_entry_size_mb: 17, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_expiration_and_dump_frequency() {
        let config = CacheConfig { default_expiration_secs: -1, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "default_expiration_secs"));

        let config = CacheConfig { dump_frequency: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "dump_frequency"));
    }

    #[test]
    fn test_validate_minimum_values() {
        let config = CacheConfig { max_size_mb: 5, max_entry_size_mb: 1, default_expiration_secs: 0, dump_frequency: 1, ..Default::default() };
        assert!(config.validate().is_ok());
    }
}
