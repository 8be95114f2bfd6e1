//! Asset Cache
//!
//! Maps integer keys to byte blobs kept in a relocating [`Heap`](super::heap::Heap),
//! under a byte budget.
//!
//! # Architecture
//!
//! ```text
//! Cache
//!   ├─→ entries (sorted by key)
//!   │     └─→ key 12 → {size 300, refs 1, hits 4, mru 97} → HeapHandle(3)
//!   ├─→ Heap (capacity = max_size)
//!   └─→ CacheSource (size / read / release)
//!
//! lock(key)
//!   ├─→ hit:  pin the existing block
//!   └─→ miss: size → make room → allocate (retry, flush, system) → read
//! ```
//!
//! Eviction prefers unreferenced entries with few hits that were used least
//! recently.

pub mod asset_cache;
pub mod entry;
pub mod eviction;
pub mod production_tests;
pub mod source;

pub use asset_cache::{Cache, CacheStats};
pub use entry::{CacheEntry, CacheHandle, CacheKey, CacheListFilter};
pub use source::{CacheSource, MemorySource};
