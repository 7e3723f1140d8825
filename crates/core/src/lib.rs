//! Core of pixstash: a two-tier image cache and the dispatcher that fills it.
//!
//! This crate provides:
//! - [`cache`]: memory and journal-backed disk tiers
//! - [`dispatch`]: deduplicated, pausable background fetches
//! - [`pool`]: the bounded worker pool fetches run on
//! - [`image`]: decoded images and bounded decoding
//! - Unified error types and layered configuration

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod image;
pub mod paths;
pub mod pool;
pub mod sys;

pub use cache::{CacheParams, CacheStats, CompressFormat, DiskKey, TieredCache};
pub use config::{AppConfig, ConfigError};
pub use dispatch::{Delivery, FetchDispatcher, RequestMode, RequestOutcome, Resolver, TargetId};
pub use error::Error;
pub use image::{CachedImage, DecodeBounds};
pub use pool::{OverflowPolicy, PoolConfig, PoolError, WorkerPool};
