//! Cache entries and handles

use crate::storage::heap::HeapHandle;
use serde::{Deserialize, Serialize};

/// Opaque integer identifying a cached asset
pub type CacheKey = i32;

/// Bookkeeping for one cached blob
///
/// The bytes themselves live in the cache's heap; an entry only records
/// where, how big, and how recently and how often it was used.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(super) key: CacheKey,
    pub(super) size: usize,
    pub(super) reference_count: u32,
    pub(super) hits: u32,
    pub(super) marked_for_eviction: bool,
    pub(super) mru: u32,
    pub(super) handle: HeapHandle,
}

impl CacheEntry {
    pub(super) fn new(key: CacheKey, size: usize, handle: HeapHandle) -> Self {
        Self {
            key,
            size,
            reference_count: 0,
            hits: 0,
            marked_for_eviction: false,
            mru: 0,
            handle,
        }
    }

    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Size reported by the source, in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of outstanding locks
    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    /// Number of cache hits since the entry was loaded
    pub fn hits(&self) -> u32 {
        self.hits
    }

    /// Value of the cache's hit counter at the last lock
    pub fn mru(&self) -> u32 {
        self.mru
    }

    pub fn is_marked_for_eviction(&self) -> bool {
        self.marked_for_eviction
    }

    pub fn is_locked(&self) -> bool {
        self.reference_count != 0
    }

    pub fn heap_handle(&self) -> HeapHandle {
        self.handle
    }
}

/// Proof of a successful [`Cache::lock`](super::Cache::lock)
///
/// Hand it back to [`Cache::unlock`](super::Cache::unlock) to release the
/// pin. The entry's bytes stay at a fixed address until then.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a locked cache entry stays pinned until the handle is unlocked"]
pub struct CacheHandle {
    pub(super) key: CacheKey,
    pub(super) heap: HeapHandle,
}

impl CacheHandle {
    pub fn key(&self) -> CacheKey {
        self.key
    }
}

/// Which entries [`Cache::create_list`](super::Cache::create_list) returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheListFilter {
    #[default]
    All,
    /// Entries with at least one outstanding lock
    Locked,
    /// Entries nobody holds
    Unlocked,
}

impl CacheListFilter {
    pub fn matches(self, entry: &CacheEntry) -> bool {
        match self {
            CacheListFilter::All => true,
            CacheListFilter::Locked => entry.is_locked(),
            CacheListFilter::Unlocked => !entry.is_locked(),
        }
    }
}
