//! Weight-bounded in-memory tier.

use crate::image::CachedImage;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;

/// Strict LRU over decoded images, bounded by their summed byte size.
///
/// Reads and writes both count as use. The lock is only held for map
/// operations.
#[derive(Debug)]
pub struct MemoryTier {
    budget: u64,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    entries: LruCache<String, Arc<CachedImage>>,
    weight: u64,
}

fn weight_of(image: &CachedImage) -> u64 {
    image.byte_size() as u64
}

impl MemoryTier {
    pub fn new(budget: u64) -> Self {
        Self { budget, inner: Mutex::new(Inner { entries: LruCache::unbounded(), weight: 0 }) }
    }

    /// Look up `key`, promoting it to most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<CachedImage>> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Insert `image` unless `key` is already present.
    ///
    /// Returns whether the image was admitted. Images heavier than the whole
    /// budget never are.
    pub fn insert_if_absent(&self, key: &str, image: Arc<CachedImage>) -> bool {
        let weight = weight_of(&image);
        if weight > self.budget {
            tracing::debug!(key, weight, budget = self.budget, "Image exceeds memory budget, not cached");
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.entries.contains(key) {
            inner.entries.promote(key);
            return false;
        }

        while inner.weight + weight > self.budget {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.weight -= weight_of(&evicted),
                None => break,
            }
        }

        inner.entries.put(key.to_string(), image);
        inner.weight += weight;
        true
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.weight = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summed byte size of the cached images.
    pub fn weight(&self) -> u64 {
        self.inner.lock().weight
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::fixtures::solid;

    // 2x2 RGBA = 16 bytes
    fn img() -> Arc<CachedImage> {
        Arc::new(solid(2, 2, [0, 0, 0, 255]))
    }

    #[test]
    fn test_insert_and_get() {
        let tier = MemoryTier::new(64);
        assert!(tier.insert_if_absent("a", img()));
        assert!(tier.get("a").is_some());
        assert_eq!(tier.weight(), 16);
    }

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let tier = MemoryTier::new(64);
        let first = img();
        assert!(tier.insert_if_absent("a", first.clone()));
        assert!(!tier.insert_if_absent("a", img()));
        assert!(Arc::ptr_eq(&tier.get("a").unwrap(), &first));
        assert_eq!(tier.weight(), 16);
    }

    #[test]
    fn test_weight_never_exceeds_budget() {
        let tier = MemoryTier::new(40);
        for key in ["a", "b", "c", "d", "e"] {
            tier.insert_if_absent(key, img());
            assert!(tier.weight() <= 40);
        }
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_strict_lru_read_promotes() {
        let tier = MemoryTier::new(48);
        tier.insert_if_absent("a", img());
        tier.insert_if_absent("b", img());
        tier.insert_if_absent("c", img());

        // touching `a` leaves `b` as the eviction candidate
        tier.get("a");
        tier.insert_if_absent("d", img());

        assert!(tier.contains("a"));
        assert!(!tier.contains("b"));
        assert!(tier.contains("c"));
        assert!(tier.contains("d"));
    }

    #[test]
    fn test_oversized_image_not_admitted() {
        let tier = MemoryTier::new(10);
        assert!(!tier.insert_if_absent("big", img()));
        assert!(tier.is_empty());
        assert_eq!(tier.weight(), 0);
    }

    #[test]
    fn test_clear() {
        let tier = MemoryTier::new(64);
        tier.insert_if_absent("a", img());
        tier.insert_if_absent("b", img());
        assert_eq!(tier.weight(), 32);

        tier.clear();
        assert!(tier.is_empty());
        assert_eq!(tier.weight(), 0);
    }
}
