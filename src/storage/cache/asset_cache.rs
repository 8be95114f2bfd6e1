//! Budgeted, reference-counted cache on top of the relocating heap

use super::entry::{CacheEntry, CacheHandle, CacheKey, CacheListFilter};
use super::eviction::{eviction_threshold, mark_victims, rerank};
use super::source::CacheSource;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::storage::heap::{Heap, HeapHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Key → blob cache whose bytes live in a private [`Heap`]
///
/// Entries are loaded through the [`CacheSource`] on first lock and stay
/// until evicted to make room, discarded or flushed. Locked entries are never
/// evicted and their bytes never move.
///
/// # Example
///
/// ```
/// use heapcache::{Cache, MemorySource};
///
/// let mut source = MemorySource::new();
/// source.insert(1, b"sprite".to_vec());
///
/// let mut cache = Cache::new(source, 4096)?;
/// let handle = cache.lock(1)?;
/// assert_eq!(cache.data(&handle)?, b"sprite");
/// cache.unlock(handle)?;
/// # Ok::<(), heapcache::error::Error>(())
/// ```
pub struct Cache<S: CacheSource> {
    source: S,
    heap: Heap,
    config: CacheConfig,
    /// Sorted by key
    entries: Vec<CacheEntry>,
    /// Sum of entry sizes
    size: usize,
    /// Global hit counter used for `mru` stamps
    counter: u32,
    lookup_hits: u64,
    misses: u64,
    evictions: u64,
    miss_hook: Option<Box<dyn FnMut()>>,
}

impl<S: CacheSource> Cache<S> {
    /// Create a cache with default tunables and a `max_size` byte budget
    pub fn new(source: S, max_size: usize) -> Result<Self> {
        Self::with_config(source, CacheConfig::with_max_size(max_size))
    }

    pub fn with_config(source: S, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let heap = Heap::new(config.max_size)?;

        info!(
            max_size = config.max_size,
            capacity = config.initial_capacity,
            "Initialized cache"
        );

        Ok(Self {
            source,
            heap,
            entries: Vec::with_capacity(config.initial_capacity),
            config,
            size: 0,
            counter: 0,
            lookup_hits: 0,
            misses: 0,
            evictions: 0,
            miss_hook: None,
        })
    }

    /// Whether `key` is currently cached
    pub fn query(&self, key: CacheKey) -> bool {
        self.find(key).is_ok()
    }

    /// Pin `key`'s bytes, loading them through the source on a miss
    pub fn lock(&mut self, key: CacheKey) -> Result<CacheHandle> {
        let index = match self.find(key) {
            Ok(index) => {
                self.entries[index].hits += 1;
                self.lookup_hits += 1;
                metrics::counter!("heapcache_cache_hits_total").increment(1);
                index
            }
            Err(_) => {
                let index = self.fetch(key)?;
                self.tick_miss();
                index
            }
        };

        let entry = &mut self.entries[index];
        if entry.reference_count == 0 {
            self.heap.lock(entry.handle)?;
        }
        entry.reference_count += 1;

        self.counter += 1;
        entry.mru = self.counter;
        let handle = CacheHandle {
            key,
            heap: entry.handle,
        };

        if self.counter == u32::MAX {
            self.reset_counter();
        }

        Ok(handle)
    }

    /// Bytes of a locked entry
    pub fn data(&self, handle: &CacheHandle) -> Result<&[u8]> {
        let entry = self.locked_entry(handle)?;
        let size = entry.size;
        Ok(&self.heap.payload(handle.heap)?[..size])
    }

    /// Mutable bytes of a locked entry
    pub fn data_mut(&mut self, handle: &CacheHandle) -> Result<&mut [u8]> {
        let size = self.locked_entry(handle)?.size;
        Ok(&mut self.heap.payload_mut(handle.heap)?[..size])
    }

    /// Release one lock; the bytes may move once the last lock is gone
    pub fn unlock(&mut self, handle: CacheHandle) -> Result<()> {
        let index = self.locked_index(&handle)?;
        let entry = &mut self.entries[index];

        entry.reference_count -= 1;
        if entry.reference_count == 0 {
            self.heap.unlock(entry.handle)?;
        }
        Ok(())
    }

    /// Evict `key` now, unless it is locked or not cached
    pub fn discard(&mut self, key: CacheKey) -> bool {
        let Ok(index) = self.find(key) else {
            return false;
        };
        let entry = &mut self.entries[index];
        if entry.is_locked() {
            return false;
        }

        entry.marked_for_eviction = true;
        self.purge();
        true
    }

    /// Evict every unlocked entry and shrink the entry table
    pub fn flush(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| !e.is_locked()) {
            entry.marked_for_eviction = true;
        }
        let removed = self.purge();

        let optimal = self.entries.len() + self.config.capacity_step;
        if optimal < self.entries.capacity() {
            self.entries.shrink_to(optimal);
        }

        debug!(removed, remaining = self.entries.len(), "Flushed cache");
    }

    /// Keys of the entries selected by `filter`, in key order
    pub fn create_list(&self, filter: CacheListFilter) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .map(CacheEntry::key)
            .collect()
    }

    /// Sum of cached entry sizes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: CacheKey) -> Option<&CacheEntry> {
        self.find(key).ok().map(|index| &self.entries[index])
    }

    /// All entries in key order
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Install a hook fired on every `miss_tick_interval`-th miss
    pub fn set_miss_hook<F>(&mut self, hook: F)
    where
        F: FnMut() + 'static,
    {
        self.miss_hook = Some(Box::new(hook));
    }

    pub fn clear_miss_hook(&mut self) {
        self.miss_hook = None;
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.lookup_hits + self.misses;
        let hit_rate = if lookups > 0 {
            self.lookup_hits as f64 / lookups as f64
        } else {
            0.0
        };

        CacheStats {
            entries: self.entries.len(),
            capacity: self.entries.capacity(),
            size: self.size,
            max_size: self.config.max_size,
            hits: self.lookup_hits,
            misses: self.misses,
            hit_rate,
            evictions: self.evictions,
            counter: self.counter,
        }
    }

    fn find(&self, key: CacheKey) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&key, |entry| entry.key)
    }

    fn locked_index(&self, handle: &CacheHandle) -> Result<usize> {
        let index = self
            .find(handle.key)
            .map_err(|_| Error::Misuse(format!("Key {} is not cached", handle.key)))?;
        let entry = &self.entries[index];
        if entry.handle != handle.heap || !entry.is_locked() {
            return Err(Error::Misuse(format!("Key {} is not locked", handle.key)));
        }
        Ok(index)
    }

    fn locked_entry(&self, handle: &CacheHandle) -> Result<&CacheEntry> {
        self.locked_index(handle).map(|index| &self.entries[index])
    }

    /// Load `key` from the source and insert it; returns its index
    fn fetch(&mut self, key: CacheKey) -> Result<usize> {
        self.misses += 1;
        metrics::counter!("heapcache_cache_misses_total").increment(1);

        let size = self.source.size(key)?;
        let max_size = self.config.max_size;
        if size > max_size {
            warn!(key, size, max_size, "Entry does not fit in cache budget");
            return Err(Error::OutOfBudget {
                requested: size,
                max_size,
            });
        }
        if !self.make_room(size) {
            warn!(key, size, "Could not make room for entry");
            return Err(Error::AllocationFailed(size));
        }

        let handle = self.allocate(size)?;
        if let Err(err) = self.fill(key, handle, size) {
            if let Err(dealloc) = self.heap.deallocate(handle) {
                warn!(key, error = %dealloc, "Failed to release block of failed entry");
            }
            return Err(err);
        }

        if self.entries.len() + 1 >= self.entries.capacity() {
            let additional =
                self.entries.capacity() + self.config.capacity_step - self.entries.len();
            self.entries.reserve_exact(additional);
        }

        let index = self.entries.partition_point(|entry| entry.key < key);
        self.entries.insert(index, CacheEntry::new(key, size, handle));
        self.size += size;
        metrics::gauge!("heapcache_cache_size_bytes").set(self.size as f64);

        debug!(key, size, index, "Cached entry");
        Ok(index)
    }

    /// Get a heap block for a new entry, evicting and flushing as needed
    fn allocate(&mut self, size: usize) -> Result<HeapHandle> {
        let mut target = size as f64;
        for _ in 0..self.config.allocation_attempts {
            if let Ok(handle) = self.heap.allocate(size, false) {
                return Ok(handle);
            }

            target += size as f64 * self.config.growth_factor;
            if target > self.config.max_size as f64 || !self.make_room(target as usize) {
                break;
            }
        }

        info!(size, "Flushing cache to fit entry");
        self.flush();

        match self.heap.allocate(size, false) {
            Ok(handle) => Ok(handle),
            Err(_) => self.heap.allocate(size, true),
        }
    }

    fn fill(&mut self, key: CacheKey, handle: HeapHandle, size: usize) -> Result<()> {
        let buf = self.heap.lock(handle)?;
        let read = self.source.read(key, &mut buf[..size]);
        self.heap.unlock(handle)?;
        read
    }

    /// Evict entries until `requested` more bytes fit in the budget
    fn make_room(&mut self, requested: usize) -> bool {
        let max_size = self.config.max_size;
        if requested > max_size {
            return false;
        }
        if max_size.saturating_sub(self.size) >= requested {
            return true;
        }

        let threshold = eviction_threshold(requested, self.size, self.config.eviction_slack);
        let marked = mark_victims(&mut self.entries, threshold);
        let removed = self.purge();

        debug!(requested, threshold, marked, removed, size = self.size, "Made room");
        max_size.saturating_sub(self.size) >= requested
    }

    /// Remove unlocked entries marked for eviction; unmark locked ones
    fn purge(&mut self) -> usize {
        let heap = &mut self.heap;
        let source = &mut self.source;
        let mut freed = 0;
        let mut removed = 0;

        self.entries.retain_mut(|entry| {
            if !entry.marked_for_eviction {
                return true;
            }
            if entry.is_locked() {
                entry.marked_for_eviction = false;
                return true;
            }

            if let Some(data) = heap.peek(entry.handle) {
                source.release(entry.key, &data[..entry.size.min(data.len())]);
            }
            if let Err(err) = heap.deallocate(entry.handle) {
                warn!(key = entry.key, error = %err, "Failed to release evicted entry");
            }
            freed += entry.size;
            removed += 1;
            false
        });

        if removed > 0 {
            self.size -= freed;
            self.evictions += removed as u64;
            metrics::counter!("heapcache_cache_evictions_total").increment(removed as u64);
            metrics::gauge!("heapcache_cache_size_bytes").set(self.size as f64);
        }
        removed
    }

    fn reset_counter(&mut self) {
        self.counter = rerank(&mut self.entries);
        debug!(counter = self.counter, "Reset cache hit counter");
    }

    fn tick_miss(&mut self) {
        let interval = self.config.miss_tick_interval as u64;
        if interval == 0 || self.misses % interval != 0 {
            return;
        }
        if let Some(hook) = self.miss_hook.as_mut() {
            hook();
        }
    }

    fn unlock_all(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| e.is_locked()) {
            if let Err(err) = self.heap.unlock(entry.handle) {
                warn!(key = entry.key, error = %err, "Failed to unlock entry");
            }
            entry.reference_count = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_counter(&mut self, counter: u32) {
        self.counter = counter;
    }
}

impl<S: CacheSource> Drop for Cache<S> {
    fn drop(&mut self) {
        self.unlock_all();
        self.flush();
        debug!(evictions = self.evictions, "Released cache");
    }
}

impl<S: CacheSource> fmt::Debug for Cache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &self.entries.len())
            .field("size", &self.size)
            .field("max_size", &self.config.max_size)
            .field("heap", &self.heap)
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Entry table capacity
    pub capacity: usize,
    pub size: usize,
    pub max_size: usize,
    /// Locks served from the cache
    pub hits: u64,
    /// Locks that went to the source
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    /// Current value of the hit counter behind `mru` stamps
    pub counter: u32,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Cache]")?;
        writeln!(f, "Entries: {} (capacity {})", self.entries, self.capacity)?;
        writeln!(f, "Size: {} / {}", self.size, self.max_size)?;
        writeln!(
            f,
            "Hits: {}, misses: {} ({:.1}%)",
            self.hits,
            self.misses,
            self.hit_rate * 100.0
        )?;
        write!(f, "Evictions: {}", self.evictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::MemorySource;

    fn source_with(blobs: &[(CacheKey, usize)]) -> MemorySource {
        let mut source = MemorySource::new();
        for &(key, size) in blobs {
            source.insert(key, vec![key as u8; size]);
        }
        source
    }

    #[test]
    fn test_cache_basic() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 10), (2, 20)]), 1024)?;
        assert!(!cache.query(1));

        let handle = cache.lock(1)?;
        assert!(cache.query(1));
        assert_eq!(cache.data(&handle)?, &[1u8; 10][..]);
        assert_eq!(cache.size(), 10);
        cache.unlock(handle)?;

        // Second lock is a hit
        let handle = cache.lock(1)?;
        cache.unlock(handle)?;

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(cache.source().reads(), 1);
        cache.heap().validate()
    }

    #[test]
    fn test_entries_stay_sorted() -> Result<()> {
        let keys = [5, -2, 9, 0, 3];
        let blobs: Vec<(CacheKey, usize)> = keys.iter().map(|&k| (k, 8)).collect();
        let mut cache = Cache::new(source_with(&blobs), 4096)?;

        for key in keys {
            let handle = cache.lock(key)?;
            cache.unlock(handle)?;
        }
        assert_eq!(cache.create_list(CacheListFilter::All), vec![-2, 0, 3, 5, 9]);
        Ok(())
    }

    #[test]
    fn test_unaligned_size_is_exact() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(4, 13)]), 1024)?;
        let handle = cache.lock(4)?;
        assert_eq!(cache.data(&handle)?.len(), 13);
        cache.data_mut(&handle)?[0] = 0xFF;
        assert_eq!(cache.data(&handle)?[0], 0xFF);
        cache.unlock(handle)
    }

    #[test]
    fn test_out_of_budget() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 2000)]), 1024)?;
        assert!(matches!(
            cache.lock(1),
            Err(Error::OutOfBudget {
                requested: 2000,
                max_size: 1024
            })
        ));
        assert!(cache.is_empty());
        Ok(())
    }

    struct FailingRead;

    impl CacheSource for FailingRead {
        fn size(&mut self, _key: CacheKey) -> Result<usize> {
            Ok(32)
        }

        fn read(&mut self, key: CacheKey, _buf: &mut [u8]) -> Result<()> {
            Err(Error::Source(format!("read of {} failed", key)))
        }
    }

    #[test]
    fn test_source_failure_releases_block() -> Result<()> {
        let mut cache = Cache::new(MemorySource::new(), 1024)?;
        assert!(matches!(cache.lock(3), Err(Error::Source(_))));

        let mut cache = Cache::new(FailingRead, 1024)?;
        assert!(matches!(cache.lock(3), Err(Error::Source(_))));
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.heap().stats().moveable_blocks, 0);
        assert_eq!(cache.heap().stats().locked_blocks, 0);
        cache.heap().validate()
    }

    #[test]
    fn test_unlock_misuse() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 10)]), 1024)?;
        let handle = cache.lock(1)?;
        let forged = CacheHandle {
            key: handle.key,
            heap: handle.heap,
        };
        cache.unlock(handle)?;
        assert!(matches!(cache.unlock(forged), Err(Error::Misuse(_))));
        Ok(())
    }

    #[test]
    fn test_discard_and_flush() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 10), (2, 10), (3, 10)]), 1024)?;
        for key in [1, 2, 3] {
            let handle = cache.lock(key)?;
            cache.unlock(handle)?;
        }
        let pinned = cache.lock(2)?;

        assert!(!cache.discard(2));
        assert!(cache.discard(1));
        assert!(!cache.discard(1));
        assert_eq!(cache.size(), 20);

        cache.flush();
        assert_eq!(cache.create_list(CacheListFilter::All), vec![2]);
        assert_eq!(cache.create_list(CacheListFilter::Locked), vec![2]);
        assert!(cache.create_list(CacheListFilter::Unlocked).is_empty());
        assert_eq!(cache.source().released(), &[1, 3]);

        cache.unlock(pinned)?;
        cache.heap().validate()
    }

    #[test]
    fn test_table_grows_and_shrinks() -> Result<()> {
        let config = CacheConfig {
            max_size: 64 * 1024,
            initial_capacity: 4,
            capacity_step: 4,
            ..CacheConfig::default()
        };
        let blobs: Vec<(CacheKey, usize)> = (0..20).map(|k| (k, 16)).collect();
        let mut cache = Cache::with_config(source_with(&blobs), config)?;

        for key in 0..20 {
            let handle = cache.lock(key)?;
            cache.unlock(handle)?;
        }
        assert_eq!(cache.len(), 20);
        assert!(cache.stats().capacity >= 20);

        cache.flush();
        assert!(cache.is_empty());
        assert!(cache.stats().capacity <= 4);
        Ok(())
    }

    #[test]
    fn test_stats_display() -> Result<()> {
        let cache = Cache::new(MemorySource::new(), 1024)?;
        let text = cache.stats().to_string();
        assert!(text.starts_with("[Cache]\nEntries: 0"));
        assert!(text.contains("Size: 0 / 1024"));
        Ok(())
    }
}
