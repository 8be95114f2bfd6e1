//! Eviction policy
//!
//! Victims are chosen from the coldest end of this ordering:
//!
//! ```text
//! unreferenced ──→ referenced
//!   hits asc
//!     mru asc
//! ```
//!
//! Marking stops at a size threshold of the requested bytes plus a slack
//! fraction of the current cache size, so one eviction pass frees a little
//! more than strictly needed.

use super::entry::CacheEntry;
use std::cmp::Ordering;

fn eviction_cmp(a: &CacheEntry, b: &CacheEntry) -> Ordering {
    a.is_locked()
        .cmp(&b.is_locked())
        .then(a.hits.cmp(&b.hits))
        .then(a.mru.cmp(&b.mru))
}

/// Indices of `entries`, coldest first
pub(crate) fn eviction_order(entries: &[CacheEntry]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| eviction_cmp(&entries[a], &entries[b]));
    order
}

/// Bytes that one eviction pass aims to free
pub(crate) fn eviction_threshold(requested: usize, cache_size: usize, slack: f64) -> usize {
    requested + (cache_size as f64 * slack).floor() as usize
}

/// Mark entries for eviction and return how many were marked
///
/// A single unreferenced entry at least `threshold` bytes large is marked on
/// its own. Otherwise unreferenced entries are summed coldest first until the
/// sum reaches `threshold`, and every unreferenced entry from that point back
/// to the coldest is marked. If the sum never gets there, all unreferenced
/// entries are marked.
pub(crate) fn mark_victims(entries: &mut [CacheEntry], threshold: usize) -> usize {
    let order = eviction_order(entries);
    let mut accum = 0;
    let mut stop = order.len();

    for (position, &index) in order.iter().enumerate() {
        let entry = &mut entries[index];
        if entry.is_locked() {
            continue;
        }
        if entry.size >= threshold {
            entry.marked_for_eviction = true;
            return 1;
        }
        accum += entry.size;
        if accum >= threshold {
            stop = position;
            break;
        }
    }

    if accum == 0 {
        return 0;
    }
    let stop = stop.min(order.len() - 1);

    let mut marked = 0;
    for &index in order[..=stop].iter().rev() {
        let entry = &mut entries[index];
        if !entry.is_locked() {
            entry.marked_for_eviction = true;
            marked += 1;
        }
    }
    marked
}

/// Re-rank `mru` stamps to `0..len`, oldest first
///
/// Returns the value the hit counter restarts from.
pub(crate) fn rerank(entries: &mut [CacheEntry]) -> u32 {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by_key(|&index| entries[index].mru);
    for (rank, index) in order.into_iter().enumerate() {
        entries[index].mru = rank as u32;
    }
    entries.len() as u32
}
