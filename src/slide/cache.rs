//! Region cache for decoded pyramid reads.
//!
//! Warping walks the output canvas tile by tile, and adjacent output tiles
//! usually map back to overlapping source patches. Caching decoded regions
//! avoids re-reading and re-decoding the same source pixels for every
//! neighboring tile. [`CachedAccessor`] wraps any [`PyramidAccessor`] and
//! routes its region reads through a shared [`RegionCache`].
//!
//! # Cache Key
//!
//! Regions are cached by slide identity, pyramid level, and the exact
//! region rectangle. A [`super::PixelRegion`] shares its buffer, so cache
//! hits clone a handle, not pixels.
//!
//! # Size-Based Eviction
//!
//! The cache tracks the total decoded size in bytes and evicts
//! least-recently-used entries when capacity is exceeded.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::error::SlideError;

use super::{Level, PhysicalPixelSize, PixelRegion, PyramidAccessor, RegionBox};

/// Default cache capacity: 256MB of decoded pixels.
pub const DEFAULT_REGION_CACHE_CAPACITY: usize = 256 * 1024 * 1024;

/// Default maximum number of entries (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: usize = 4_096;

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key for one decoded region of one pyramid level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionCacheKey {
    /// Slide identity (source path or logical id)
    pub slide_id: Arc<str>,

    /// Pyramid level (0 = full resolution)
    pub level: u32,

    /// Region X origin in level coordinates
    pub x: u32,

    /// Region Y origin in level coordinates
    pub y: u32,

    /// Region width in pixels
    pub width: u32,

    /// Region height in pixels
    pub height: u32,
}

impl RegionCacheKey {
    /// Create a new cache key.
    pub fn new(slide_id: impl Into<Arc<str>>, level: u32, region: RegionBox) -> Self {
        Self {
            slide_id: slide_id.into(),
            level,
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
        }
    }
}

// =============================================================================
// Region Cache
// =============================================================================

/// LRU cache for decoded regions with size-based capacity.
///
/// Thread-safe; share across async tasks via `Arc`.
///
/// # Example
///
/// ```
/// use wsi_registrar::slide::{PixelRegion, RegionBox, RegionCache, RegionCacheKey};
///
/// #[tokio::main]
/// async fn main() {
///     let cache = RegionCache::new();
///
///     let key = RegionCacheKey::new("slides/a.tiff", 2, RegionBox::new(0, 0, 2, 2));
///     let region = PixelRegion::from_interleaved(2, 2, 1, vec![1, 2, 3, 4]);
///
///     cache.put(key.clone(), region.clone()).await;
///     assert_eq!(cache.get(&key).await, Some(region));
/// }
/// ```
pub struct RegionCache {
    /// The underlying LRU cache
    cache: RwLock<LruCache<RegionCacheKey, PixelRegion>>,

    /// Maximum total size in bytes
    max_size: usize,

    /// Current total size in bytes
    current_size: RwLock<usize>,
}

impl RegionCache {
    /// Create a new region cache with default capacity (256MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REGION_CACHE_CAPACITY)
    }

    /// Create a new region cache with the specified capacity in bytes.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum total size of cached regions in bytes
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    /// Create a new region cache with specified capacity and maximum entries.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum total size of cached regions in bytes
    /// * `max_entries` - Maximum number of entries in the cache
    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        Self {
            cache: RwLock::new(LruCache::new(
                std::num::NonZeroUsize::new(max_entries).unwrap(),
            )),
            max_size,
            current_size: RwLock::new(0),
        }
    }

    /// Get a region from the cache.
    ///
    /// Returns `Some(region)` if cached, `None` otherwise. This operation
    /// marks the entry as recently used.
    pub async fn get(&self, key: &RegionCacheKey) -> Option<PixelRegion> {
        let mut cache = self.cache.write().await;
        cache.get(key).cloned()
    }

    /// Check if a region is in the cache without updating LRU order.
    pub async fn contains(&self, key: &RegionCacheKey) -> bool {
        let cache = self.cache.read().await;
        cache.contains(key)
    }

    /// Store a region in the cache.
    ///
    /// If the cache is over capacity after insertion, least-recently-used
    /// entries are evicted until the cache is within capacity.
    pub async fn put(&self, key: RegionCacheKey, region: PixelRegion) {
        let region_size = region.byte_len();
        let mut cache = self.cache.write().await;
        let mut current_size = self.current_size.write().await;

        // If key exists, subtract old size first
        if let Some(old) = cache.peek(&key) {
            *current_size = current_size.saturating_sub(old.byte_len());
        }

        cache.put(key, region);
        *current_size += region_size;

        // Evict entries until we're under capacity
        while *current_size > self.max_size {
            if let Some((_, evicted)) = cache.pop_lru() {
                *current_size = current_size.saturating_sub(evicted.byte_len());
            } else {
                break;
            }
        }
    }

    /// Remove all entries belonging to one slide.
    ///
    /// Used when a slide's accessor is closed so stale pixels cannot be
    /// served for a re-opened slide.
    pub async fn evict_slide(&self, slide_id: &str) {
        let mut cache = self.cache.write().await;
        let mut current_size = self.current_size.write().await;

        let keys: Vec<RegionCacheKey> = cache
            .iter()
            .filter(|(key, _)| key.slide_id.as_ref() == slide_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(region) = cache.pop(&key) {
                *current_size = current_size.saturating_sub(region.byte_len());
            }
        }
    }

    /// Clear all entries from the cache.
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        let mut current_size = self.current_size.write().await;
        cache.clear();
        *current_size = 0;
    }

    /// Get the current number of cached regions.
    pub async fn len(&self) -> usize {
        let cache = self.cache.read().await;
        cache.len()
    }

    /// Check if the cache is empty.
    pub async fn is_empty(&self) -> bool {
        let cache = self.cache.read().await;
        cache.is_empty()
    }

    /// Get the current total size of cached regions in bytes.
    pub async fn size(&self) -> usize {
        let current_size = self.current_size.read().await;
        *current_size
    }

    /// Get the maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for RegionCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Cached Accessor
// =============================================================================

/// Caching decorator over a [`PyramidAccessor`].
///
/// Metadata calls pass straight through; `read_region` consults the shared
/// [`RegionCache`] first and only decodes on a miss. Concurrent requests for
/// the same region are deduplicated with the singleflight pattern: one task
/// decodes while the others wait and pick up the cached result.
pub struct CachedAccessor<A> {
    /// The wrapped accessor
    inner: A,

    /// Slide identity, pre-interned for cache keys
    identity: Arc<str>,

    /// Shared cache of decoded regions
    cache: Arc<RegionCache>,

    /// In-flight decodes, for request deduplication
    in_flight: Mutex<HashMap<RegionCacheKey, Arc<Notify>>>,
}

impl<A: PyramidAccessor> CachedAccessor<A> {
    /// Wrap an accessor so its region reads go through `cache`.
    pub fn new(inner: A, cache: Arc<RegionCache>) -> Self {
        let identity: Arc<str> = Arc::from(inner.identity());
        Self {
            inner,
            identity,
            cache,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped accessor.
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: PyramidAccessor + 'static> PyramidAccessor for CachedAccessor<A> {
    fn identity(&self) -> &str {
        self.inner.identity()
    }

    fn levels(&self) -> &[Level] {
        self.inner.levels()
    }

    fn channel_names(&self) -> &[String] {
        self.inner.channel_names()
    }

    fn pixel_size(&self) -> Option<PhysicalPixelSize> {
        self.inner.pixel_size()
    }

    async fn read_region(
        &self,
        level: usize,
        region: RegionBox,
    ) -> Result<PixelRegion, SlideError> {
        let key = RegionCacheKey::new(Arc::clone(&self.identity), level as u32, region);

        loop {
            // Fast path: already decoded
            if let Some(hit) = self.cache.get(&key).await {
                return Ok(hit);
            }

            // Slow path: wait on an in-flight decode or become the leader
            let notify = {
                let mut in_flight = self.in_flight.lock().await;

                if let Some(notify) = in_flight.get(&key) {
                    // Another task is decoding this region, wait for it
                    let notify = Arc::clone(notify);
                    drop(in_flight);
                    notify.notified().await;
                    // Loop back to check the cache
                    continue;
                }

                // We're the leader for this region
                let notify = Arc::new(Notify::new());
                in_flight.insert(key.clone(), Arc::clone(&notify));
                notify
            };

            let result = self.inner.read_region(level, region).await;

            if let Ok(pixels) = &result {
                self.cache.put(key.clone(), pixels.clone()).await;
            }
            {
                let mut in_flight = self.in_flight.lock().await;
                in_flight.remove(&key);
            }
            notify.notify_waiters();

            return result;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_key(slide: &str, level: u32, x: u32, y: u32) -> RegionCacheKey {
        RegionCacheKey::new(slide, level, RegionBox::new(x, y, 16, 16))
    }

    fn make_region(side: u32, fill: u8) -> PixelRegion {
        PixelRegion::from_interleaved(side, side, 1, vec![fill; (side * side) as usize])
    }

    #[tokio::test]
    async fn test_basic_get_put() {
        let cache = RegionCache::new();

        let key = make_key("a.tiff", 0, 0, 0);
        let region = make_region(16, 7);

        assert!(cache.get(&key).await.is_none());

        cache.put(key.clone(), region.clone()).await;
        assert_eq!(cache.get(&key).await, Some(region));
    }

    #[tokio::test]
    async fn test_contains() {
        let cache = RegionCache::new();

        let key = make_key("a.tiff", 0, 0, 0);
        assert!(!cache.contains(&key).await);

        cache.put(key.clone(), make_region(8, 1)).await;
        assert!(cache.contains(&key).await);
    }

    #[tokio::test]
    async fn test_size_tracking() {
        let cache = RegionCache::with_capacity(10_000);

        assert_eq!(cache.size().await, 0);

        // 10x10 single channel = 100 bytes
        cache.put(make_key("a", 0, 0, 0), make_region(10, 0)).await;
        assert_eq!(cache.size().await, 100);

        cache.put(make_key("b", 0, 0, 0), make_region(20, 0)).await;
        assert_eq!(cache.size().await, 500);
    }

    #[tokio::test]
    async fn test_size_based_eviction() {
        // Capacity for two 400-byte regions.
        let cache = RegionCache::with_capacity_and_entries(1000, 100);

        cache.put(make_key("a", 0, 0, 0), make_region(20, 0)).await;
        cache.put(make_key("b", 0, 0, 0), make_region(20, 0)).await;

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.size().await, 800);

        cache.put(make_key("c", 0, 0, 0), make_region(20, 0)).await;

        // LRU entry ("a") should be evicted
        assert!(cache.size().await <= 1000);
        assert!(!cache.contains(&make_key("a", 0, 0, 0)).await);
        assert!(cache.contains(&make_key("b", 0, 0, 0)).await);
        assert!(cache.contains(&make_key("c", 0, 0, 0)).await);
    }

    #[tokio::test]
    async fn test_update_existing_entry() {
        let cache = RegionCache::with_capacity(10_000);

        let key = make_key("a.tiff", 0, 0, 0);

        cache.put(key.clone(), make_region(20, 0)).await;
        assert_eq!(cache.size().await, 400);

        cache.put(key.clone(), make_region(10, 0)).await;
        assert_eq!(cache.size().await, 100);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_evict_slide() {
        let cache = RegionCache::with_capacity(10_000);

        cache.put(make_key("a.tiff", 0, 0, 0), make_region(8, 1)).await;
        cache.put(make_key("a.tiff", 1, 0, 0), make_region(8, 2)).await;
        cache.put(make_key("b.tiff", 0, 0, 0), make_region(8, 3)).await;

        cache.evict_slide("a.tiff").await;

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.size().await, 64);
        assert!(cache.contains(&make_key("b.tiff", 0, 0, 0)).await);
    }

    #[tokio::test]
    async fn test_lru_order() {
        let cache = RegionCache::with_capacity_and_entries(1200, 100);

        // Three 20x20 regions of 400 bytes each fill the cache.
        cache.put(make_key("a", 0, 0, 0), make_region(20, 0)).await;
        cache.put(make_key("b", 0, 0, 0), make_region(20, 0)).await;
        cache.put(make_key("c", 0, 0, 0), make_region(20, 0)).await;

        // Touch "a" so "b" becomes the LRU entry.
        cache.get(&make_key("a", 0, 0, 0)).await;

        cache.put(make_key("d", 0, 0, 0), make_region(20, 0)).await;

        assert!(cache.contains(&make_key("a", 0, 0, 0)).await);
        assert!(!cache.contains(&make_key("b", 0, 0, 0)).await);
        assert!(cache.contains(&make_key("c", 0, 0, 0)).await);
        assert!(cache.contains(&make_key("d", 0, 0, 0)).await);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = RegionCache::with_capacity(10_000);

        cache.put(make_key("a", 0, 0, 0), make_region(8, 0)).await;
        cache.put(make_key("b", 0, 0, 0), make_region(8, 0)).await;

        cache.clear().await;

        assert!(cache.is_empty().await);
        assert_eq!(cache.size().await, 0);
    }

    #[test]
    fn test_cache_key_equality() {
        let key1 = make_key("a.tiff", 0, 16, 32);
        let key2 = make_key("a.tiff", 0, 16, 32);
        let key3 = make_key("a.tiff", 1, 16, 32);

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    // =========================================================================
    // Cached Accessor Tests
    // =========================================================================

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::slide::MemoryPyramid;

    /// Counts how many region reads reach the wrapped pyramid.
    struct CountingPyramid {
        inner: MemoryPyramid,
        reads: AtomicUsize,
    }

    impl CountingPyramid {
        fn new(inner: MemoryPyramid) -> Self {
            Self {
                inner,
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PyramidAccessor for CountingPyramid {
        fn identity(&self) -> &str {
            self.inner.identity()
        }

        fn levels(&self) -> &[Level] {
            self.inner.levels()
        }

        fn channel_names(&self) -> &[String] {
            self.inner.channel_names()
        }

        fn pixel_size(&self) -> Option<PhysicalPixelSize> {
            self.inner.pixel_size()
        }

        async fn read_region(
            &self,
            level: usize,
            region: RegionBox,
        ) -> Result<PixelRegion, SlideError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_region(level, region).await
        }
    }

    /// Slow pyramid that panics if two decodes of it ever overlap.
    struct SlowPyramid {
        inner: MemoryPyramid,
        reads: AtomicUsize,
        decoding: AtomicBool,
    }

    impl SlowPyramid {
        fn new(inner: MemoryPyramid) -> Self {
            Self {
                inner,
                reads: AtomicUsize::new(0),
                decoding: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PyramidAccessor for SlowPyramid {
        fn identity(&self) -> &str {
            self.inner.identity()
        }

        fn levels(&self) -> &[Level] {
            self.inner.levels()
        }

        fn channel_names(&self) -> &[String] {
            self.inner.channel_names()
        }

        fn pixel_size(&self) -> Option<PhysicalPixelSize> {
            self.inner.pixel_size()
        }

        async fn read_region(
            &self,
            level: usize,
            region: RegionBox,
        ) -> Result<PixelRegion, SlideError> {
            assert!(
                !self.decoding.swap(true, Ordering::SeqCst),
                "overlapping decode of the same slide"
            );
            self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let out = self.inner.read_region(level, region).await;
            self.decoding.store(false, Ordering::SeqCst);
            out
        }
    }

    fn gradient_pyramid(identity: &str) -> MemoryPyramid {
        let mut data = Vec::with_capacity(64 * 64);
        for y in 0u32..64 {
            for x in 0u32..64 {
                data.push(((x * 3 + y * 5) % 256) as u8);
            }
        }
        MemoryPyramid::from_gray(identity, 64, 64, data)
    }

    #[tokio::test]
    async fn test_cached_accessor_second_read_hits() {
        let cached = CachedAccessor::new(
            CountingPyramid::new(gradient_pyramid("a.tiff")),
            Arc::new(RegionCache::new()),
        );

        let region = RegionBox::new(8, 8, 16, 16);
        let first = cached.read_region(0, region).await.unwrap();
        let second = cached.read_region(0, region).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cached.inner().reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_accessor_distinct_regions_miss() {
        let cached = CachedAccessor::new(
            CountingPyramid::new(gradient_pyramid("a.tiff")),
            Arc::new(RegionCache::new()),
        );

        cached
            .read_region(0, RegionBox::new(0, 0, 16, 16))
            .await
            .unwrap();
        cached
            .read_region(0, RegionBox::new(16, 0, 16, 16))
            .await
            .unwrap();

        assert_eq!(cached.inner().reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_accessor_metadata_passthrough() {
        let inner = gradient_pyramid("a.tiff");
        let levels = inner.level_count();
        let cached = CachedAccessor::new(
            CountingPyramid::new(inner),
            Arc::new(RegionCache::new()),
        );

        assert_eq!(cached.identity(), "a.tiff");
        assert_eq!(cached.level_count(), levels);
        assert_eq!(cached.channel_names(), &["gray".to_string()]);
        assert_eq!(cached.inner().reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_accessor_keys_by_slide() {
        // Two slides share one cache without serving each other's pixels.
        let cache = Arc::new(RegionCache::new());
        let a = CachedAccessor::new(
            CountingPyramid::new(gradient_pyramid("a.tiff")),
            Arc::clone(&cache),
        );
        let b = CachedAccessor::new(
            CountingPyramid::new(MemoryPyramid::from_gray("b.tiff", 64, 64, vec![9; 64 * 64])),
            Arc::clone(&cache),
        );

        let region = RegionBox::new(0, 0, 8, 8);
        let from_a = a.read_region(0, region).await.unwrap();
        let from_b = b.read_region(0, region).await.unwrap();

        assert_ne!(from_a, from_b);
        assert_eq!(cache.len().await, 2);
        assert_eq!(a.inner().reads.load(Ordering::SeqCst), 1);
        assert_eq!(b.inner().reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_accessor_singleflight() {
        let cached = Arc::new(CachedAccessor::new(
            SlowPyramid::new(gradient_pyramid("a.tiff")),
            Arc::new(RegionCache::new()),
        ));

        let region = RegionBox::new(4, 4, 8, 8);
        let first = tokio::spawn({
            let cached = Arc::clone(&cached);
            async move { cached.read_region(0, region).await }
        });
        let second = tokio::spawn({
            let cached = Arc::clone(&cached);
            async move { cached.read_region(0, region).await }
        });

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(cached.inner().reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_accessor_errors_not_cached() {
        let cached = CachedAccessor::new(
            CountingPyramid::new(gradient_pyramid("a.tiff")),
            Arc::new(RegionCache::new()),
        );

        let out_of_bounds = RegionBox::new(60, 60, 16, 16);
        for _ in 0..2 {
            let err = cached.read_region(0, out_of_bounds).await.unwrap_err();
            assert!(matches!(err, SlideError::RegionOutOfBounds { .. }));
        }

        // Each failed attempt reached the inner accessor.
        assert_eq!(cached.inner().reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_accessor_scaled_reads_reuse_regions() {
        let cached = CachedAccessor::new(
            CountingPyramid::new(gradient_pyramid("a.tiff")),
            Arc::new(RegionCache::new()),
        );

        let first = cached.read_scaled(0.25).await.unwrap();
        let reads_after_first = cached.inner().reads.load(Ordering::SeqCst);
        let second = cached.read_scaled(0.25).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cached.inner().reads.load(Ordering::SeqCst), reads_after_first);
    }
}
