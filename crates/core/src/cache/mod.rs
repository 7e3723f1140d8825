//! Two-tier image cache.
//!
//! - [`MemoryTier`]: weight-bounded strict LRU of decoded images
//! - [`PersistentTier`]: lazily opened [`JournalStore`] behind a readiness gate
//! - [`TieredCache`]: both tiers for one namespace, re-encoding on the way to disk
//!
//! Entries on disk are addressed by [`DiskKey`], a digest of the caller's key.

pub mod hash;
pub mod memory;
pub mod migrations;
pub mod params;
pub mod persistent;
pub mod store;
pub mod tiered;

pub use hash::{DiskKey, KeyDigest};
pub use memory::MemoryTier;
pub use params::{CacheParams, CompressFormat, STORE_VERSION};
pub use persistent::{PersistentTier, TierState};
pub use store::{Editor, JournalStore, Snapshot};
pub use tiered::{CacheStats, TieredCache};
