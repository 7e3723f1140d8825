//! Memory tier in front of a re-encoding disk tier.

use super::hash::DiskKey;
use super::memory::MemoryTier;
use super::params::CacheParams;
use super::persistent::{PersistentTier, TierState};
use crate::config::ConfigError;
use crate::image::CachedImage;
use serde::Serialize;
use std::sync::Arc;

/// Point-in-time counters of a [`TieredCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_weight: u64,
    pub memory_budget: u64,
    pub persistent_state: TierState,
    pub persistent_available: bool,
    pub persistent_bytes: u64,
}

/// Two-tier image cache of one namespace.
#[derive(Debug)]
pub struct TieredCache {
    params: CacheParams,
    memory: Option<MemoryTier>,
    persistent: PersistentTier,
}

impl TieredCache {
    /// Validate `params` and build the cache. Touches no files.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the parameters are invalid.
    pub fn new(params: CacheParams) -> Result<Self, ConfigError> {
        params.validate()?;

        let memory = params.memory_tier_enabled.then(|| MemoryTier::new(params.memory_budget_bytes));
        let persistent = match (&params.disk_dir, params.disk_tier_enabled) {
            (Some(dir), true) => {
                PersistentTier::new(dir, params.disk_budget_bytes, params.store_version, params.clear_on_start)
            }
            _ => PersistentTier::disabled(),
        };

        Ok(Self { params, memory, persistent })
    }

    /// Like [`new`](Self::new), but also opens the disk tier when
    /// `init_eagerly` is set.
    pub async fn open(params: CacheParams) -> Result<Self, ConfigError> {
        let cache = Self::new(params)?;
        if cache.params.init_eagerly {
            cache.init_persistent_tier().await;
        }
        Ok(cache)
    }

    pub fn params(&self) -> &CacheParams {
        &self.params
    }

    pub fn disk_key(&self, key: &str) -> DiskKey {
        DiskKey::derive_with(key, self.params.key_digest)
    }

    /// Open the disk tier. Idempotent; failures leave it disabled.
    pub async fn init_persistent_tier(&self) {
        self.persistent.init().await;
    }

    /// Memory-only lookup. Never blocks on I/O.
    pub fn get_memory(&self, key: &str) -> Option<Arc<CachedImage>> {
        let hit = self.memory.as_ref()?.get(key);
        if hit.is_some() {
            tracing::debug!(key, "Memory cache hit");
        }
        hit
    }

    /// Disk-tier lookup; waits until the tier is ready.
    pub async fn get_persistent(&self, key: &str) -> Option<Arc<CachedImage>> {
        if key.is_empty() {
            return None;
        }
        let disk_key = self.disk_key(key);
        let snapshot = self.persistent.get(&disk_key).await?;

        let decoded = tokio::task::spawn_blocking(move || CachedImage::decode(snapshot.bytes())).await;
        match decoded {
            Ok(Ok(image)) => {
                tracing::debug!(key, %disk_key, "Disk cache hit");
                Some(Arc::new(image))
            }
            Ok(Err(e)) => {
                tracing::warn!(key, %disk_key, error = %e, "Stored image is undecodable");
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Decode task failed");
                None
            }
        }
    }

    /// Memory, then disk.
    pub async fn get(&self, key: &str) -> Option<Arc<CachedImage>> {
        match self.get_memory(key) {
            Some(image) => Some(image),
            None => self.get_persistent(key).await,
        }
    }

    /// Insert into the memory tier only.
    pub fn insert_memory(&self, key: &str, image: Arc<CachedImage>) {
        if let Some(memory) = &self.memory {
            memory.insert_if_absent(key, image);
        }
    }

    /// Insert into both tiers. Existing entries are never replaced.
    pub async fn put(&self, key: &str, image: Arc<CachedImage>) {
        if key.is_empty() {
            tracing::debug!("Ignoring put with empty key");
            return;
        }
        self.insert_memory(key, image.clone());

        let Some(store) = self.persistent.store().await else {
            return;
        };
        let disk_key = self.disk_key(key);
        match store.contains(&disk_key).await {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                tracing::debug!(key, error = %e, "Disk tier unavailable for put");
                return;
            }
        }

        let (format, quality) = (self.params.compress_format, self.params.compress_quality);
        let encoded = tokio::task::spawn_blocking(move || image.encode(format, quality)).await;
        let bytes = match encoded {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                tracing::warn!(key, error = %e, "Failed to encode image for disk tier");
                return;
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Encode task failed");
                return;
            }
        };

        if self.persistent.put_if_absent(&disk_key, &bytes).await {
            tracing::debug!(key, %disk_key, size = bytes.len(), "Stored image in disk tier");
        }
    }

    /// Drop everything from both tiers.
    pub async fn evict_all(&self) {
        if let Some(memory) = &self.memory {
            memory.clear();
        }
        self.persistent.evict().await;
        tracing::debug!(namespace_dir = ?self.params.disk_dir, "Cache cleared");
    }

    pub async fn flush(&self) {
        self.persistent.flush().await;
    }

    /// Release the disk tier until the next [`init_persistent_tier`](Self::init_persistent_tier).
    pub async fn close(&self) {
        self.persistent.close().await;
    }

    pub async fn stats(&self) -> CacheStats {
        let (memory_entries, memory_weight, memory_budget) = match &self.memory {
            Some(memory) => (memory.len(), memory.weight(), memory.budget()),
            None => (0, 0, 0),
        };
        CacheStats {
            memory_entries,
            memory_weight,
            memory_budget,
            persistent_state: self.persistent.state(),
            persistent_available: self.persistent.is_available(),
            persistent_bytes: self.persistent.size_bytes().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CompressFormat;
    use crate::image::fixtures::solid;

    fn params(dir: &std::path::Path) -> CacheParams {
        CacheParams { memory_budget_bytes: 4096, ..CacheParams::new(dir) }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_params() {
        let dir = tempfile::tempdir().unwrap();
        let bad = CacheParams { disk_budget_bytes: 0, ..params(dir.path()) };
        assert!(TieredCache::new(bad).is_err());
    }

    #[tokio::test]
    async fn test_new_does_not_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("images");
        let _cache = TieredCache::new(params(&store_dir)).unwrap();
        assert!(!store_dir.exists());
    }

    #[tokio::test]
    async fn test_open_eagerly() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::open(CacheParams { init_eagerly: true, ..params(dir.path()) }).await.unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.persistent_state, TierState::Ready);
        assert!(stats.persistent_available);
    }

    #[tokio::test]
    async fn test_put_then_get_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(params(dir.path())).unwrap();
        cache.init_persistent_tier().await;

        let image = Arc::new(solid(4, 4, [9, 8, 7, 255]));
        cache.put("k", image.clone()).await;

        assert!(Arc::ptr_eq(&cache.get_memory("k").unwrap(), &image));
        let from_disk = cache.get_persistent("k").await.unwrap();
        assert_eq!(*from_disk, *image);
    }

    #[tokio::test]
    async fn test_warm_disk_cold_memory() {
        let dir = tempfile::tempdir().unwrap();
        let image = solid(3, 3, [1, 1, 1, 255]);
        {
            let cache = TieredCache::new(params(dir.path())).unwrap();
            cache.init_persistent_tier().await;
            cache.put("k", Arc::new(image.clone())).await;
            cache.close().await;
        }

        let cache = TieredCache::new(params(dir.path())).unwrap();
        cache.init_persistent_tier().await;
        assert!(cache.get_memory("k").is_none());
        assert_eq!(*cache.get("k").await.unwrap(), image);
    }

    #[tokio::test]
    async fn test_persistent_entry_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(CacheParams { memory_tier_enabled: false, ..params(dir.path()) }).unwrap();
        cache.init_persistent_tier().await;

        let first = solid(2, 2, [255, 0, 0, 255]);
        cache.put("k", Arc::new(first.clone())).await;
        cache.put("k", Arc::new(solid(2, 2, [0, 0, 255, 255]))).await;

        assert_eq!(*cache.get_persistent("k").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_jpeg_round_trip_keeps_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(CacheParams {
            compress_format: CompressFormat::Jpeg,
            compress_quality: 90,
            ..params(dir.path())
        })
        .unwrap();
        cache.init_persistent_tier().await;

        cache.put("k", Arc::new(solid(16, 8, [100, 100, 100, 255]))).await;
        let stored = cache.get_persistent("k").await.unwrap();
        assert_eq!((stored.width(), stored.height()), (16, 8));
    }

    #[tokio::test]
    async fn test_degraded_mode_still_serves_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(CacheParams { disk_budget_bytes: u64::MAX, ..params(dir.path()) }).unwrap();
        cache.init_persistent_tier().await;

        cache.put("k", Arc::new(solid(2, 2, [0, 0, 0, 255]))).await;
        assert!(cache.get_memory("k").is_some());
        assert!(cache.get_persistent("k").await.is_none());
        assert!(!cache.stats().await.persistent_available);
    }

    #[tokio::test]
    async fn test_evict_all_clears_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(params(dir.path())).unwrap();
        cache.init_persistent_tier().await;
        cache.put("k", Arc::new(solid(2, 2, [0, 0, 0, 255]))).await;

        cache.evict_all().await;

        assert!(cache.get("k").await.is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.persistent_bytes, 0);
    }

    #[tokio::test]
    async fn test_close_then_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(CacheParams { memory_tier_enabled: false, ..params(dir.path()) }).unwrap();
        cache.init_persistent_tier().await;
        cache.put("k", Arc::new(solid(2, 2, [0, 0, 0, 255]))).await;
        cache.flush().await;

        cache.close().await;
        assert!(cache.get("k").await.is_none());

        cache.init_persistent_tier().await;
        assert!(cache.get("k").await.is_some());
    }

    #[tokio::test]
    async fn test_memory_only_cache() {
        let cache = TieredCache::new(CacheParams { disk_tier_enabled: false, ..CacheParams::default() }).unwrap();
        cache.put("k", Arc::new(solid(2, 2, [0, 0, 0, 255]))).await;
        assert!(cache.get("k").await.is_some());
        assert!(cache.get_persistent("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_stats_serialize_for_reporting() {
        let cache = TieredCache::new(CacheParams { disk_tier_enabled: false, ..CacheParams::default() }).unwrap();
        cache.put("k", Arc::new(solid(2, 2, [0, 0, 0, 255]))).await;

        let json = serde_json::to_value(cache.stats().await).unwrap();
        assert_eq!(json["memory_entries"], 1);
        assert_eq!(json["memory_weight"], 16);
        assert_eq!(json["persistent_state"], "ready");
        assert_eq!(json["persistent_available"], false);
    }

    fn noise(width: u32, height: u32) -> CachedImage {
        let pixels = (0..width * height).flat_map(|i| [(i * 7919 % 251) as u8, (i % 17) as u8, 90, 255]).collect();
        CachedImage::from_rgba(width, height, pixels).unwrap()
    }

    #[tokio::test]
    async fn test_oversized_encoding_keeps_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(CacheParams {
            disk_budget_bytes: 200,
            memory_tier_enabled: false,
            ..params(dir.path())
        })
        .unwrap();
        cache.init_persistent_tier().await;

        cache.put("small", Arc::new(solid(1, 1, [1, 2, 3, 255]))).await;
        cache.put("big", Arc::new(noise(32, 32))).await;

        assert!(cache.get_persistent("small").await.is_some());
        assert!(cache.get_persistent("big").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_get_and_put_during_evict_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(TieredCache::new(CacheParams { memory_tier_enabled: false, ..params(dir.path()) }).unwrap());
        cache.init_persistent_tier().await;

        let mut workers = Vec::new();
        for n in 0..4u8 {
            let cache = cache.clone();
            workers.push(tokio::spawn(async move {
                let image = solid(3, 2, [n, 10, 20, 255]);
                for i in 0..20 {
                    let key = format!("k{n}-{i}");
                    cache.put(&key, Arc::new(image.clone())).await;
                    if let Some(found) = cache.get(&key).await {
                        assert_eq!(*found, image);
                    }
                }
            }));
        }

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.evict_all().await;
        cache.close().await;
        cache.init_persistent_tier().await;
        cache.evict_all().await;

        for worker in workers {
            worker.await.unwrap();
        }

        let image = solid(2, 2, [5, 5, 5, 255]);
        cache.put("after", Arc::new(image.clone())).await;
        assert_eq!(*cache.get_persistent("after").await.unwrap(), image);
    }
}
