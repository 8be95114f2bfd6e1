//! Relocating Heap
//!
//! A fixed arena of framed blocks, addressed through stable handles so that
//! unpinned blocks can be moved to defragment free space.
//!
//! # Architecture
//!
//! ```text
//! HandleTable
//!   ├─→ Handle(0) → Arena(0)      [moveable]
//!   ├─→ Handle(1) → Arena(140)    [locked]
//!   └─→ Handle(2) → System(Box)   [system]
//!
//! Arena
//!   [hdr|payload|ftr][hdr|payload|ftr][hdr|  free  |ftr] ...
//!
//! Allocation:
//!   ├─→ smallest FREE block that fits (after merging neighbours)
//!   ├─→ evacuate a moveable extent into FREE blocks elsewhere
//!   ├─→ slide a moveable extent's blocks to its front
//!   └─→ system memory (opt-in)
//! ```
//!
//! Locked blocks never move. Every block carries guard words that are checked
//! on lock, unlock, deallocation and whole-heap validation.

pub mod allocator;
pub mod block;
pub(crate) mod compaction;
pub(crate) mod free_list;
pub mod handle;

pub use allocator::{Heap, HeapReport, HeapStats};
pub use block::{BlockState, BLOCK_OVERHEAD, MIN_BLOCK_SIZE};
pub use handle::HeapHandle;
