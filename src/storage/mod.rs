//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! Cache (key → blob, byte budget, eviction)
//!   └─→ Heap (arena of framed blocks, handle table, compaction)
//!        └─→ System memory (fallback for blocks the arena cannot fit)
//! ```
//!
//! ## Heap
//!
//! Blocks are owned through handles and only addressable while locked, which
//! lets the heap relocate everything else when it runs out of contiguous
//! space.
//!
//! ## Cache
//!
//! The cache pins entries with a reference count, loads misses through a
//! [`CacheSource`](cache::CacheSource), and evicts unreferenced entries with
//! the fewest hits and the oldest use first.

pub mod cache;
pub mod heap;

pub use cache::{Cache, CacheSource, CacheStats};
pub use heap::{Heap, HeapHandle, HeapStats};
