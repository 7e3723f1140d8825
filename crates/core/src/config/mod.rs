//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (PIXSTASH_*)
//! 2. TOML config file (if PIXSTASH_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheParams, CompressFormat};
use crate::pool::{OverflowPolicy, PoolConfig};

mod validation;

pub use validation::ConfigError;

/// Worker pool settings as they appear in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Workers that never retire.
    #[serde(default = "default_core_size")]
    pub core_size: usize,

    /// Upper bound on workers, including burst workers.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Idle time after which a burst worker retires, in milliseconds.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,

    /// Capacity of the task backlog.
    #[serde(default = "default_backlog")]
    pub backlog: usize,

    /// What happens when the backlog is full and no burst worker may start.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_core_size() -> usize {
    5
}

fn default_max_size() -> usize {
    15
}

fn default_keep_alive_ms() -> u64 {
    10_000
}

fn default_backlog() -> usize {
    30
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            core_size: default_core_size(),
            max_size: default_max_size(),
            keep_alive_ms: default_keep_alive_ms(),
            backlog: default_backlog(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig {
            core_size: settings.core_size,
            max_size: settings.max_size,
            keep_alive: Duration::from_millis(settings.keep_alive_ms),
            backlog: settings.backlog,
            overflow: settings.overflow,
        }
    }
}

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (PIXSTASH_*)
/// 2. TOML config file (if PIXSTASH_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base directory for the on-disk caches.
    ///
    /// Falls back to the platform cache directory when unset.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Namespace of the image cache (one subdirectory per namespace).
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Memory tier budget in bytes.
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: u64,

    /// Memory tier budget as a fraction of the process memory budget.
    ///
    /// Takes precedence over `memory_budget_bytes` when set. Must lie in
    /// `[0.05, 0.8]`.
    #[serde(default)]
    pub memory_budget_percent: Option<f32>,

    /// Process memory budget that `memory_budget_percent` applies to.
    ///
    /// Defaults to the physical memory of the machine.
    #[serde(default)]
    pub process_memory_bytes: Option<u64>,

    /// Budget of the re-encoded image store in bytes.
    #[serde(default = "default_disk_budget_bytes")]
    pub disk_budget_bytes: u64,

    /// Budget of the raw download store in bytes.
    #[serde(default = "default_http_cache_budget_bytes")]
    pub http_cache_budget_bytes: u64,

    /// Encoding used for the re-encoded image store.
    #[serde(default)]
    pub compress_format: CompressFormat,

    /// Encoder quality, 0-100.
    #[serde(default = "default_compress_quality")]
    pub compress_quality: u8,

    #[serde(default = "default_true")]
    pub memory_tier_enabled: bool,

    #[serde(default = "default_true")]
    pub disk_tier_enabled: bool,

    /// Wipe the on-disk stores when they are first opened.
    #[serde(default)]
    pub clear_on_start: bool,

    /// Open the on-disk stores while constructing the cache.
    #[serde(default)]
    pub init_eagerly: bool,

    /// Decoded images are sampled down towards this width.
    #[serde(default = "default_target_dimension")]
    pub target_width: u32,

    /// Decoded images are sampled down towards this height.
    #[serde(default = "default_target_dimension")]
    pub target_height: u32,

    /// Largest full-resolution pixel count decoded for formats without
    /// streaming or scaled decoders.
    #[serde(default = "default_max_decoded_pixels")]
    pub max_decoded_pixels: u64,

    /// User-Agent string for HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum bytes to download per image.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    #[serde(default)]
    pub pool: PoolSettings,
}

fn default_namespace() -> String {
    "images".into()
}

fn default_memory_budget_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_disk_budget_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_http_cache_budget_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_compress_quality() -> u8 {
    70
}

fn default_target_dimension() -> u32 {
    100
}

fn default_max_decoded_pixels() -> u64 {
    16 * 1024 * 1024
}

fn default_user_agent() -> String {
    "pixstash/0.1".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_bytes() -> usize {
    5_242_880 // 5MB
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            namespace: default_namespace(),
            memory_budget_bytes: default_memory_budget_bytes(),
            memory_budget_percent: None,
            process_memory_bytes: None,
            disk_budget_bytes: default_disk_budget_bytes(),
            http_cache_budget_bytes: default_http_cache_budget_bytes(),
            compress_format: CompressFormat::default(),
            compress_quality: default_compress_quality(),
            memory_tier_enabled: true,
            disk_tier_enabled: true,
            clear_on_start: false,
            init_eagerly: false,
            target_width: default_target_dimension(),
            target_height: default_target_dimension(),
            max_decoded_pixels: default_max_decoded_pixels(),
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            max_bytes: default_max_bytes(),
            pool: PoolSettings::default(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `PIXSTASH_`
    /// 2. TOML file from `PIXSTASH_CONFIG_FILE` (if set)
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

        if let Ok(config_path) = std::env::var("PIXSTASH_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("PIXSTASH_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Build the parameters of the image cache rooted at `dir`.
    ///
    /// Resolves a percentage memory budget against the process memory budget.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the percentage is out of range or the
    /// resulting parameters fail validation.
    pub fn cache_params(&self, dir: PathBuf) -> Result<CacheParams, ConfigError> {
        let mut params = CacheParams {
            memory_budget_bytes: self.memory_budget_bytes,
            disk_budget_bytes: self.disk_budget_bytes,
            disk_dir: Some(dir),
            compress_format: self.compress_format,
            compress_quality: self.compress_quality,
            memory_tier_enabled: self.memory_tier_enabled,
            disk_tier_enabled: self.disk_tier_enabled,
            clear_on_start: self.clear_on_start,
            init_eagerly: self.init_eagerly,
            ..CacheParams::default()
        };

        if let Some(percent) = self.memory_budget_percent {
            let process_budget = self.process_memory_bytes.unwrap_or_else(crate::sys::physical_memory);
            params = params.with_memory_percent(percent, process_budget)?;
        }

        params.validate()?;
        Ok(params)
    }

    /// Worker pool configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from(&self.pool)
    }
}
