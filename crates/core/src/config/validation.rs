//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `memory_budget_percent` is outside `[0.05, 0.8]`
    /// - `compress_quality` exceeds 100
    /// - `max_bytes` is 0 or exceeds 50MB
    /// - `http_cache_budget_bytes` is smaller than `max_bytes` while the disk
    ///   tier is enabled
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` or `namespace` is empty
    /// - target dimensions are zero
    /// - pool sizes are inconsistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(percent) = self.memory_budget_percent
            && !(0.05..=0.8).contains(&percent)
        {
            return Err(ConfigError::Invalid {
                field: "memory_budget_percent".into(),
                reason: "must be between 0.05 and 0.8 (inclusive)".into(),
            });
        }

        if self.compress_quality > 100 {
            return Err(ConfigError::Invalid { field: "compress_quality".into(), reason: "must be 0-100".into() });
        }

        if self.max_bytes == 0 {
            return Err(ConfigError::Invalid { field: "max_bytes".into(), reason: "must be greater than 0".into() });
        }
        if self.max_bytes > 50 * 1024 * 1024 {
            return Err(ConfigError::Invalid { field: "max_bytes".into(), reason: "must not exceed 50MB".into() });
        }

        if self.disk_tier_enabled && self.http_cache_budget_bytes < self.max_bytes as u64 {
            return Err(ConfigError::Invalid {
                field: "http_cache_budget_bytes".into(),
                reason: format!("must be at least max_bytes ({})", self.max_bytes),
            });
        }

        if self.timeout_ms < 100 {
            return Err(ConfigError::Invalid { field: "timeout_ms".into(), reason: "must be at least 100ms".into() });
        }
        if self.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid { field: "user_agent".into(), reason: "must not be empty".into() });
        }

        if self.namespace.is_empty() || self.namespace.contains(['/', '\\']) {
            return Err(ConfigError::Invalid {
                field: "namespace".into(),
                reason: "must be a non-empty single path component".into(),
            });
        }

        if self.target_width == 0 || self.target_height == 0 {
            return Err(ConfigError::Invalid {
                field: "target_width".into(),
                reason: "target dimensions must be greater than 0".into(),
            });
        }

        if self.pool.core_size == 0 {
            return Err(ConfigError::Invalid { field: "pool.core_size".into(), reason: "must be greater than 0".into() });
        }
        if self.pool.max_size < self.pool.core_size {
            return Err(ConfigError::Invalid {
                field: "pool.max_size".into(),
                reason: "must be at least pool.core_size".into(),
            });
        }
        if self.pool.backlog == 0 {
            return Err(ConfigError::Invalid { field: "pool.backlog".into(), reason: "must be greater than 0".into() });
        }

        if !self.memory_tier_enabled && !self.disk_tier_enabled {
            tracing::warn!("Both cache tiers are disabled; every request will hit the network");
        }

        Ok(())
    }
}
