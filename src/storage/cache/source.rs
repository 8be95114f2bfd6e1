//! Where cached bytes come from

use super::entry::CacheKey;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Supplier of the bytes behind each cache key
///
/// The cache owns its source, so a source can never call back into the
/// cache that is driving it.
pub trait CacheSource {
    /// Size in bytes of the blob for `key`
    fn size(&mut self, key: CacheKey) -> Result<usize>;

    /// Fill `buf` (exactly [`CacheSource::size`] bytes) with the blob for `key`
    fn read(&mut self, key: CacheKey, buf: &mut [u8]) -> Result<()>;

    /// Called with the cached bytes right before an entry is evicted
    fn release(&mut self, _key: CacheKey, _data: &[u8]) {}
}

impl<S: CacheSource + ?Sized> CacheSource for Box<S> {
    fn size(&mut self, key: CacheKey) -> Result<usize> {
        (**self).size(key)
    }

    fn read(&mut self, key: CacheKey, buf: &mut [u8]) -> Result<()> {
        (**self).read(key, buf)
    }

    fn release(&mut self, key: CacheKey, data: &[u8]) {
        (**self).release(key, data)
    }
}

/// In-memory source backed by a map of blobs
///
/// Every released key is recorded until [`MemorySource::take_released`]
/// drains the list, so long-running users should drain it periodically.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    blobs: HashMap<CacheKey, Vec<u8>>,
    reads: usize,
    released: Vec<CacheKey>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: CacheKey, data: impl Into<Vec<u8>>) {
        self.blobs.insert(key, data.into());
    }

    pub fn get(&self, key: CacheKey) -> Option<&[u8]> {
        self.blobs.get(&key).map(Vec::as_slice)
    }

    /// Number of successful reads so far
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Keys passed to [`CacheSource::release`], in order
    pub fn released(&self) -> &[CacheKey] {
        &self.released
    }

    /// Drain the recorded released keys
    pub fn take_released(&mut self) -> Vec<CacheKey> {
        std::mem::take(&mut self.released)
    }
}

impl CacheSource for MemorySource {
    fn size(&mut self, key: CacheKey) -> Result<usize> {
        self.blobs
            .get(&key)
            .map(Vec::len)
            .ok_or_else(|| Error::Source(format!("No blob for key {}", key)))
    }

    fn read(&mut self, key: CacheKey, buf: &mut [u8]) -> Result<()> {
        let blob = self
            .blobs
            .get(&key)
            .ok_or_else(|| Error::Source(format!("No blob for key {}", key)))?;
        if blob.len() != buf.len() {
            return Err(Error::Source(format!(
                "Blob {} is {} bytes, buffer is {}",
                key,
                blob.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(blob);
        self.reads += 1;
        Ok(())
    }

    fn release(&mut self, key: CacheKey, _data: &[u8]) {
        self.released.push(key);
    }
}
