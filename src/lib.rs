// heapcache - Rust Implementation
// A budgeted asset cache on top of a relocating, handle-indirected heap

//! Two layers:
//!
//! - [`storage::heap`]: a fixed arena of framed blocks reached through
//!   stable handles. Unpinned blocks may be moved to defragment free space.
//! - [`storage::cache`]: integer key → byte blob cache whose bytes live in a
//!   heap, kept under a byte budget by a hits/recency eviction policy.
//!
//! Both are single-threaded and share nothing between instances.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod storage;

// Re-exports for convenience
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use storage::cache::{
    Cache, CacheEntry, CacheHandle, CacheKey, CacheListFilter, CacheSource, CacheStats,
    MemorySource,
};
pub use storage::heap::{BlockState, Heap, HeapHandle, HeapReport, HeapStats};

/// heapcache error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Entry of {requested} bytes exceeds cache budget of {max_size} bytes")]
        OutOfBudget { requested: usize, max_size: usize },

        #[error("Allocation of {0} bytes failed")]
        AllocationFailed(usize),

        #[error("Heap corruption: {0}")]
        Corruption(String),

        #[error("Misuse: {0}")]
        Misuse(String),

        #[error("Invalid handle: {0}")]
        InvalidHandle(u32),

        #[error("Source error: {0}")]
        Source(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::OutOfBudget {
            requested: 10,
            max_size: 5,
        };
        assert_eq!(
            err.to_string(),
            "Entry of 10 bytes exceeds cache budget of 5 bytes"
        );
        assert_eq!(Error::InvalidHandle(3).to_string(), "Invalid handle: 3");
    }
}
