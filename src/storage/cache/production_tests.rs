//! Eviction and pinning scenarios for the cache
//!
//! These run the whole lock/miss/evict path against an in-memory source.

#[cfg(test)]
mod integration {
    use crate::config::CacheConfig;
    use crate::error::Result;
    use crate::storage::cache::{Cache, CacheKey, CacheListFilter, CacheSource, MemorySource};
    use crate::storage::heap::{BlockState, HeapHandle};
    use std::cell::Cell;
    use std::rc::Rc;

    fn source_with(blobs: &[(CacheKey, usize)]) -> MemorySource {
        let mut source = MemorySource::new();
        for &(key, size) in blobs {
            let data: Vec<u8> = (0..size).map(|i| (i as u8).wrapping_add(key as u8)).collect();
            source.insert(key, data);
        }
        source
    }

    fn touch<S: CacheSource>(cache: &mut Cache<S>, key: CacheKey) -> Result<()> {
        let handle = cache.lock(key)?;
        cache.unlock(handle)
    }

    #[test]
    fn test_production_coldest_entries_evicted() -> Result<()> {
        let mut blobs: Vec<(CacheKey, usize)> = (0..9).map(|k| (k, 80)).collect();
        blobs.push((9, 300));
        let mut cache = Cache::new(source_with(&blobs), 1000)?;

        for key in [3, 1, 4, 0, 5, 8, 2, 7, 6] {
            touch(&mut cache, key)?;
        }
        assert_eq!(cache.size(), 720);

        // 280 bytes free; threshold is 300 + 144, so six entries have to go
        touch(&mut cache, 9)?;
        assert_eq!(cache.create_list(CacheListFilter::All), vec![2, 6, 7, 9]);
        assert_eq!(cache.size(), 3 * 80 + 300);
        assert_eq!(cache.source().released(), &[0, 1, 3, 4, 5, 8]);
        assert_eq!(cache.heap().stats().system_blocks, 0);
        cache.heap().validate()
    }

    #[test]
    fn test_production_single_entry_evicted() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 600), (2, 500)]), 1000)?;
        touch(&mut cache, 1)?;

        touch(&mut cache, 2)?;
        assert_eq!(cache.create_list(CacheListFilter::All), vec![2]);
        assert_eq!(cache.size(), 500);
        assert_eq!(cache.stats().evictions, 1);
        cache.heap().validate()
    }

    #[test]
    fn test_production_large_victim_spares_small_entries() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 700), (2, 100), (3, 300)]), 1000)?;
        touch(&mut cache, 1)?;
        touch(&mut cache, 2)?;
        touch(&mut cache, 2)?;
        assert_eq!(cache.entry(2).map(|e| e.hits()), Some(1));

        // Threshold 300 + 160 is met by the 700-byte entry alone
        touch(&mut cache, 3)?;
        assert_eq!(cache.create_list(CacheListFilter::All), vec![2, 3]);
        assert_eq!(cache.size(), 400);
        cache.heap().validate()
    }

    #[test]
    fn test_production_fragmented_miss_falls_back_to_system() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 300), (2, 300), (3, 300), (4, 400)]), 1000)?;
        let first = cache.lock(1)?;
        touch(&mut cache, 2)?;
        let third = cache.lock(3)?;

        // Evicting 2 leaves 400 bytes of budget but only a 300-byte hole
        // between two pinned blocks, so retries run out and the entry
        // lands in system memory
        let fourth = cache.lock(4)?;
        assert_eq!(cache.create_list(CacheListFilter::All), vec![1, 3, 4]);
        assert_eq!(cache.size(), 1000);
        assert_eq!(cache.source().released(), &[2]);
        assert_eq!(cache.heap().stats().system_blocks, 1);
        assert_eq!(cache.heap().state(fourth.heap), Some(BlockState::LockedSystem));
        assert_eq!(Some(cache.data(&fourth)?), cache.source().get(4));

        cache.unlock(fourth)?;
        assert_eq!(cache.heap().stats().system_blocks, 1);
        cache.unlock(first)?;
        cache.unlock(third)?;
        cache.heap().validate()
    }

    #[test]
    fn test_production_retry_flush_keeps_pinned_entries() -> Result<()> {
        let config = CacheConfig {
            max_size: 1000,
            allocation_attempts: 1,
            ..CacheConfig::default()
        };
        let source = source_with(&[(1, 300), (2, 100), (3, 200), (4, 300), (5, 220)]);
        let mut cache = Cache::with_config(source, config)?;

        // [1 pinned][2][3][4 pinned], then 3 is dropped to leave a 200-byte hole
        let first = cache.lock(1)?;
        touch(&mut cache, 2)?;
        touch(&mut cache, 3)?;
        let fourth = cache.lock(4)?;
        assert!(cache.discard(3));
        assert_eq!(cache.size(), 700);

        // 300 bytes of budget, so no eviction before the flush; the hole is
        // too small until the flush frees entry 2 next to it
        let fifth = cache.lock(5)?;
        assert_eq!(cache.create_list(CacheListFilter::All), vec![1, 4, 5]);
        assert_eq!(cache.create_list(CacheListFilter::Locked), vec![1, 4, 5]);
        assert_eq!(cache.source().released(), &[3, 2]);
        assert_eq!(cache.heap().stats().system_blocks, 0);
        assert_eq!(cache.heap().offset_of(fifth.heap), Some(320));

        for handle in [&first, &fourth, &fifth] {
            assert_eq!(Some(cache.data(handle)?), cache.source().get(handle.key()));
        }
        cache.unlock(first)?;
        cache.unlock(fourth)?;
        cache.unlock(fifth)?;
        cache.heap().validate()
    }

    #[test]
    fn test_production_double_lock() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(7, 64)]), 1024)?;
        let first = cache.lock(7)?;
        let second = cache.lock(7)?;

        let entry = cache.entry(7).expect("entry is cached");
        assert_eq!(entry.reference_count(), 2);
        assert_eq!(cache.heap().stats().locked_blocks, 1);
        assert_eq!(cache.data(&first)?, cache.data(&second)?);

        cache.unlock(first)?;
        assert_eq!(cache.heap().state(entry_handle(&cache, 7)), Some(BlockState::Locked));
        cache.unlock(second)?;
        assert_eq!(cache.heap().state(entry_handle(&cache, 7)), Some(BlockState::Moveable));
        assert_eq!(cache.heap().stats().locked_blocks, 0);
        Ok(())
    }

    fn entry_handle(cache: &Cache<MemorySource>, key: CacheKey) -> HeapHandle {
        cache.entry(key).map(|e| e.heap_handle()).expect("entry is cached")
    }

    #[test]
    fn test_production_pinned_entries_survive_eviction() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 300), (2, 300), (3, 500)]), 1000)?;
        let pinned = cache.lock(1)?;
        touch(&mut cache, 2)?;

        touch(&mut cache, 3)?;
        assert_eq!(cache.create_list(CacheListFilter::All), vec![1, 3]);
        assert!(!cache.entry(1).map(|e| e.is_marked_for_eviction()).unwrap_or(true));
        assert_eq!(cache.data(&pinned)?, cache.source().get(1).unwrap_or_default());

        cache.unlock(pinned)?;
        cache.heap().validate()
    }

    #[test]
    fn test_production_bytes_survive_relocation() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 400), (2, 400), (3, 500)]), 1000)?;
        touch(&mut cache, 1)?;
        touch(&mut cache, 2)?;
        let before = cache.heap().offset_of(entry_handle(&cache, 2));
        assert!(cache.discard(1));

        // No hole is big enough, so entry 2 has to move
        touch(&mut cache, 3)?;
        assert_ne!(cache.heap().offset_of(entry_handle(&cache, 2)), before);
        assert_eq!(cache.heap().stats().system_blocks, 0);

        let handle = cache.lock(2)?;
        assert_eq!(cache.data(&handle)?, cache.source().get(2).unwrap_or_default());
        cache.unlock(handle)?;
        cache.heap().validate()
    }

    #[test]
    fn test_production_counter_rerank() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 8), (2, 8), (3, 8)]), 1024)?;
        for key in [1, 2, 3] {
            touch(&mut cache, key)?;
        }

        cache.set_counter(u32::MAX - 1);
        touch(&mut cache, 1)?;

        // Key 1 is now the most recent, the others keep their relative order
        let mru: Vec<u32> = [1, 2, 3]
            .iter()
            .filter_map(|&key| cache.entry(key).map(|e| e.mru()))
            .collect();
        assert_eq!(mru, vec![2, 0, 1]);
        assert_eq!(cache.stats().counter, 3);

        touch(&mut cache, 2)?;
        assert_eq!(cache.entry(2).map(|e| e.mru()), Some(4));
        Ok(())
    }

    #[test]
    fn test_production_miss_hook() -> Result<()> {
        let blobs: Vec<(CacheKey, usize)> = (0..8).map(|k| (k, 16)).collect();
        let mut cache = Cache::new(source_with(&blobs), 4096)?;

        let ticks = Rc::new(Cell::new(0));
        let counter = Rc::clone(&ticks);
        cache.set_miss_hook(move || counter.set(counter.get() + 1));

        for key in 0..8 {
            touch(&mut cache, key)?;
            // Hits never tick
            touch(&mut cache, key)?;
        }
        assert_eq!(ticks.get(), 2);
        Ok(())
    }

    #[test]
    fn test_production_miss_hook_disabled() -> Result<()> {
        let config = CacheConfig {
            max_size: 4096,
            miss_tick_interval: 0,
            ..CacheConfig::default()
        };
        let blobs: Vec<(CacheKey, usize)> = (0..8).map(|k| (k, 16)).collect();
        let mut cache = Cache::with_config(source_with(&blobs), config)?;

        let ticks = Rc::new(Cell::new(0));
        let counter = Rc::clone(&ticks);
        cache.set_miss_hook(move || counter.set(counter.get() + 1));

        for key in 0..8 {
            touch(&mut cache, key)?;
        }
        assert_eq!(ticks.get(), 0);
        Ok(())
    }

    #[test]
    fn test_production_drop_releases_everything() -> Result<()> {
        let mut cache = Cache::new(source_with(&[(1, 32), (2, 32)]), 1024)?;
        touch(&mut cache, 1)?;
        let _pinned = cache.lock(2)?;
        drop(cache);
        Ok(())
    }
}
