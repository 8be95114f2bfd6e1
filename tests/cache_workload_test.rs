//! Randomized cache workload checked against its source

use heapcache::{Cache, CacheConfig, CacheHandle, CacheListFilter, Error, MemorySource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_source(rng: &mut StdRng, keys: i32, max_entry: usize) -> MemorySource {
    let mut source = MemorySource::new();
    for key in 0..keys {
        let size = rng.gen_range(1..=max_entry);
        let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
        source.insert(key, data);
    }
    source
}

fn check_invariants(cache: &Cache<MemorySource>) -> heapcache::Result<()> {
    let entries = cache.entries();
    assert!(entries.windows(2).all(|w| w[0].key() < w[1].key()));
    assert_eq!(entries.iter().map(|e| e.size()).sum::<usize>(), cache.size());
    assert!(cache.size() <= cache.max_size());
    cache.heap().validate()
}

#[test]
fn test_random_workload() -> heapcache::Result<()> {
    let mut rng = StdRng::seed_from_u64(1987);
    let source = random_source(&mut rng, 64, 1500);
    let config = CacheConfig {
        max_size: 16 * 1024,
        ..CacheConfig::default()
    };
    let mut cache = Cache::with_config(source, config)?;
    let mut pinned: Vec<CacheHandle> = Vec::new();

    for _ in 0..4000 {
        let key = rng.gen_range(0..64);
        match rng.gen_range(0..20) {
            0 => {
                let locked = cache.entry(key).map(|e| e.is_locked()).unwrap_or(false);
                let cached = cache.query(key);
                assert_eq!(cache.discard(key), cached && !locked);
            }
            1 => {
                cache.flush();
                assert_eq!(cache.len(), cache.create_list(CacheListFilter::Locked).len());
            }
            _ => match cache.lock(key) {
                Ok(handle) => {
                    assert_eq!(Some(cache.data(&handle)?), cache.source().get(key));
                    if pinned.len() < 4 && rng.gen_bool(0.1) {
                        pinned.push(handle);
                    } else {
                        cache.unlock(handle)?;
                    }
                }
                Err(Error::AllocationFailed(_)) => {}
                Err(err) => return Err(err),
            },
        }

        if !pinned.is_empty() && rng.gen_bool(0.2) {
            let handle = pinned.swap_remove(rng.gen_range(0..pinned.len()));
            cache.unlock(handle)?;
        }

        check_invariants(&cache)?;
    }

    let stats = cache.stats();
    assert!(stats.hits > 0);
    assert!(stats.evictions > 0);

    for handle in pinned {
        cache.unlock(handle)?;
    }
    cache.flush();
    assert!(cache.is_empty());
    assert_eq!(cache.heap().stats().moveable_blocks, 0);
    check_invariants(&cache)
}

#[test]
fn test_oversized_entry_is_rejected() -> heapcache::Result<()> {
    let mut source = MemorySource::new();
    source.insert(1, vec![0u8; 5000]);
    let mut cache = Cache::new(source, 4096)?;

    match cache.lock(1) {
        Err(Error::OutOfBudget {
            requested,
            max_size,
        }) => {
            assert_eq!(requested, 5000);
            assert_eq!(max_size, 4096);
        }
        other => panic!("expected OutOfBudget, got {:?}", other.map(|h| h.key())),
    }
    assert!(!cache.query(1));
    Ok(())
}

#[test]
fn test_config_file_drives_cache() -> heapcache::Result<()> {
    let config = CacheConfig::from_toml_str(
        r#"
        max_size = 2048
        initial_capacity = 8
        capacity_step = 8
        "#,
    )?;
    let mut source = MemorySource::new();
    source.insert(1, b"abc".to_vec());
    let mut cache = Cache::with_config(source, config)?;

    assert_eq!(cache.max_size(), 2048);
    let handle = cache.lock(1)?;
    assert_eq!(cache.data(&handle)?, b"abc");
    cache.unlock(handle)
}
