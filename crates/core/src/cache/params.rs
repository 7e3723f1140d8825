//! Per-namespace cache parameters.

use crate::cache::hash::KeyDigest;
use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default memory tier budget (5MB).
pub const DEFAULT_MEMORY_BUDGET: u64 = 5 * 1024 * 1024;

/// Default disk tier budget (10MB).
pub const DEFAULT_DISK_BUDGET: u64 = 10 * 1024 * 1024;

/// Default encoder quality for the disk tier.
pub const DEFAULT_COMPRESS_QUALITY: u8 = 70;

/// Store format version; bumping it wipes existing stores on open.
pub const STORE_VERSION: u32 = 1;

/// Encoding used when images are written to the disk tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressFormat {
    /// Lossless; quality is ignored.
    #[default]
    Png,
    /// Lossy; alpha is dropped.
    Jpeg,
}

/// Immutable configuration of one `TieredCache`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheParams {
    pub memory_budget_bytes: u64,
    pub disk_budget_bytes: u64,
    /// Directory of the disk tier; `None` disables it.
    pub disk_dir: Option<PathBuf>,
    pub compress_format: CompressFormat,
    pub compress_quality: u8,
    pub memory_tier_enabled: bool,
    pub disk_tier_enabled: bool,
    pub clear_on_start: bool,
    pub init_eagerly: bool,
    pub key_digest: KeyDigest,
    pub store_version: u32,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
            disk_budget_bytes: DEFAULT_DISK_BUDGET,
            disk_dir: None,
            compress_format: CompressFormat::Png,
            compress_quality: DEFAULT_COMPRESS_QUALITY,
            memory_tier_enabled: true,
            disk_tier_enabled: true,
            clear_on_start: false,
            init_eagerly: false,
            key_digest: KeyDigest::Md5,
            store_version: STORE_VERSION,
        }
    }
}

impl CacheParams {
    /// Parameters for a cache whose disk tier lives in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { disk_dir: Some(dir.into()), ..Self::default() }
    }

    /// Size the memory tier as a fraction of the process memory budget.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` unless `0.05 <= percent <= 0.8`.
    pub fn with_memory_percent(mut self, percent: f32, process_budget_bytes: u64) -> Result<Self, ConfigError> {
        if !(0.05..=0.8).contains(&percent) {
            return Err(ConfigError::Invalid {
                field: "memory_budget_percent".into(),
                reason: "must be between 0.05 and 0.8 (inclusive)".into(),
            });
        }
        self.memory_budget_bytes = (f64::from(percent) * process_budget_bytes as f64).round() as u64;
        Ok(self)
    }

    /// Validate budgets and quality. Never touches the disk.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if an enabled tier has a zero budget,
    /// the disk tier has no directory, or quality exceeds 100.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_tier_enabled && self.memory_budget_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "memory_budget_bytes".into(),
                reason: "must be greater than 0 when the memory tier is enabled".into(),
            });
        }
        if self.disk_tier_enabled && self.disk_budget_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "disk_budget_bytes".into(),
                reason: "must be greater than 0 when the disk tier is enabled".into(),
            });
        }
        if self.disk_tier_enabled && self.disk_dir.is_none() {
            return Err(ConfigError::Missing {
                field: "disk_dir".into(),
                hint: "set a cache directory or disable the disk tier".into(),
            });
        }
        if self.compress_quality > 100 {
            return Err(ConfigError::Invalid { field: "compress_quality".into(), reason: "must be 0-100".into() });
        }
        Ok(())
    }
}
