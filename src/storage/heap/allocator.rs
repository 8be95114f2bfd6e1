//! Relocating heap implementation

use super::block::{
    inspect, read_header, round_to_word, write_frame, write_header, BlockHeader, BlockState,
    FrameFault, BLOCK_OVERHEAD, HEADER_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NO_HANDLE,
};
use super::compaction::{evacuate, plan_evacuation, plan_slide, slide};
use super::free_list::{build_extents, build_free_list, first_fit, BlockWalk, WalkFault};
use super::handle::{BlockLocation, HandleEntry, HandleTable, HeapHandle};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Where [`Heap::allocate`] found room for a block
enum Placement {
    /// FREE block at this arena offset
    Arena(usize),
    /// Freshly framed process allocation
    System(Box<[u8]>),
}

/// Relocating, handle-indirected heap
///
/// One contiguous arena holds framed blocks. Callers own blocks through
/// [`HeapHandle`]s; a block's bytes are only reachable while it is locked,
/// which is also the only time its address is guaranteed not to change.
///
/// Not thread-safe. Multiple heaps share nothing.
pub struct Heap {
    /// Block arena, always completely tiled by framed blocks
    arena: Vec<u8>,
    handles: HandleTable,
    stats: HeapStats,
    /// Number of corrupted frames noticed so far
    corruptions: u64,
}

impl Heap {
    /// Create a heap that can hold roughly `capacity` payload bytes
    ///
    /// The arena gets `capacity / 1024` bytes of slack for block framing.
    /// Fails when memory for the arena cannot be reserved or the capacity
    /// cannot be described by a block header.
    pub fn new(capacity: usize) -> Result<Self> {
        let size = match capacity.checked_add(capacity >> 10) {
            Some(size) if size > BLOCK_OVERHEAD && size - BLOCK_OVERHEAD <= u32::MAX as usize => {
                size
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "Heap capacity {} cannot be framed",
                    capacity
                )));
            }
        };

        let mut arena = Vec::new();
        arena
            .try_reserve_exact(size)
            .map_err(|_| Error::AllocationFailed(size))?;
        arena.resize(size, 0);

        let free_size = size - BLOCK_OVERHEAD;
        write_frame(&mut arena, 0, &BlockHeader::new(free_size, BlockState::Free, None));

        info!(capacity, arena_size = size, "Initialized heap");

        Ok(Self {
            arena,
            handles: HandleTable::new(),
            stats: HeapStats {
                free_blocks: 1,
                free_size,
                ..HeapStats::default()
            },
            corruptions: 0,
        })
    }

    /// Allocate a block of at least `size` bytes
    ///
    /// Tries, in order: the smallest FREE block that fits, evacuating a
    /// moveable extent, sliding a moveable extent, and finally (only when
    /// `allow_system` is set) a separate process allocation.
    pub fn allocate(&mut self, size: usize, allow_system: bool) -> Result<HeapHandle> {
        let size = match round_to_word(size) {
            Some(rounded) if rounded <= MAX_BLOCK_SIZE => rounded,
            _ => {
                debug!(size, "Block size exceeds header range");
                return Err(Error::AllocationFailed(size));
            }
        };

        let placement = match self.find_free_block(size) {
            Some(offset) => Placement::Arena(offset),
            None if allow_system => {
                info!(size, "Allocating block from system memory");
                debug!("{}", self.report());
                Placement::System(system_frame(size)?)
            }
            None => {
                debug!(size, "Could not allocate block");
                return Err(Error::AllocationFailed(size));
            }
        };

        let handle = match placement {
            Placement::Arena(offset) => self.bind_free_block(offset, size),
            Placement::System(frame) => {
                let handle = self.handles.acquire(HandleEntry {
                    state: BlockState::System,
                    location: BlockLocation::System(frame),
                });
                if let Some(HandleEntry {
                    location: BlockLocation::System(frame),
                    ..
                }) = self.handles.get_mut(handle)
                {
                    let header = BlockHeader::new(size, BlockState::System, Some(handle.index()));
                    write_header(&mut frame[..], 0, &header);
                }
                self.stats.system_blocks += 1;
                self.stats.system_size += size;
                metrics::counter!("heapcache_heap_system_blocks_total").increment(1);
                handle
            }
        };

        debug!(%handle, size, "Allocated heap block");
        Ok(handle)
    }

    /// Release a block
    ///
    /// Freed arena space is merged with its neighbours on the next free list
    /// build. Locked blocks cannot be released.
    pub fn deallocate(&mut self, handle: HeapHandle) -> Result<()> {
        let state = self.check_frame(handle, "deallocate")?.state;
        if state.is_locked() {
            error!(%handle, "Attempt to deallocate locked block");
            return Err(Error::Misuse(format!("{} is locked", handle)));
        }

        let entry = self
            .handles
            .release(handle)
            .ok_or(Error::InvalidHandle(handle.index()))?;

        match entry.location {
            BlockLocation::Arena(offset) => {
                let Some(mut header) = read_header(&self.arena, offset) else {
                    return Err(self.corrupted(handle, "deallocate", FrameFault::Truncated));
                };
                let size = header.size;
                header.set_state(BlockState::Free);
                header.handle = NO_HANDLE;
                write_header(&mut self.arena, offset, &header);

                self.stats.moveable_blocks -= 1;
                self.stats.moveable_size -= size;
                self.stats.free_blocks += 1;
                self.stats.free_size += size;
            }
            BlockLocation::System(frame) => {
                let size = read_header(&frame, 0).map(|h| h.size).unwrap_or(0);
                self.stats.system_blocks -= 1;
                self.stats.system_size -= size;
            }
        }

        debug!(%handle, "Deallocated heap block");
        Ok(())
    }

    /// Pin a block and return its payload
    ///
    /// The payload does not move until [`Heap::unlock`]. Locking an already
    /// locked block, or one with a damaged frame, is refused.
    pub fn lock(&mut self, handle: HeapHandle) -> Result<&mut [u8]> {
        let check = self.check_frame(handle, "lock")?;
        if let Some(fault) = check.fault {
            return Err(self.corrupted(handle, "lock", fault));
        }
        if check.state.is_locked() {
            warn!(%handle, "Attempt to lock a previously locked block");
            return Err(Error::Misuse(format!("{} is already locked", handle)));
        }

        let new_state = match check.state {
            BlockState::Moveable => BlockState::Locked,
            BlockState::System => BlockState::LockedSystem,
            other => {
                error!(%handle, state = %other, "Unknown block state during lock");
                return Err(Error::Corruption(format!("{} is {}", handle, other)));
            }
        };

        if new_state == BlockState::Locked {
            self.stats.moveable_blocks -= 1;
            self.stats.moveable_size -= check.size;
            self.stats.locked_blocks += 1;
            self.stats.locked_size += check.size;
        }
        self.set_state(handle, new_state);
        self.payload_mut(handle)
    }

    /// Unpin a block; its payload may move again afterwards
    pub fn unlock(&mut self, handle: HeapHandle) -> Result<()> {
        let check = self.check_frame(handle, "unlock")?;
        if !check.state.is_locked() {
            warn!(%handle, "Attempt to unlock a previously unlocked block");
            return Err(Error::Misuse(format!("{} is not locked", handle)));
        }

        let new_state = if check.state.is_system() {
            BlockState::System
        } else {
            self.stats.locked_blocks -= 1;
            self.stats.locked_size -= check.size;
            self.stats.moveable_blocks += 1;
            self.stats.moveable_size += check.size;
            BlockState::Moveable
        };

        self.set_state(handle, new_state);
        Ok(())
    }

    /// Payload of a locked block
    pub fn payload(&self, handle: HeapHandle) -> Result<&[u8]> {
        let (frame, offset) = self.locked_frame(handle)?;
        let size = read_header(frame, offset)
            .map(|h| h.size)
            .ok_or(Error::InvalidHandle(handle.index()))?;
        let start = offset + HEADER_SIZE;
        frame
            .get(start..start + size)
            .ok_or_else(|| Error::Corruption(format!("{} runs past its buffer", handle)))
    }

    /// Mutable payload of a locked block
    pub fn payload_mut(&mut self, handle: HeapHandle) -> Result<&mut [u8]> {
        let entry = self
            .handles
            .get_mut(handle)
            .ok_or(Error::InvalidHandle(handle.index()))?;
        if !entry.state.is_locked() {
            return Err(Error::Misuse(format!("{} is not locked", handle)));
        }

        let (frame, offset) = match &mut entry.location {
            BlockLocation::Arena(offset) => (self.arena.as_mut_slice(), *offset),
            BlockLocation::System(frame) => (&mut frame[..], 0),
        };
        let size = read_header(frame, offset)
            .map(|h| h.size)
            .ok_or(Error::InvalidHandle(handle.index()))?;
        let start = offset + HEADER_SIZE;
        frame
            .get_mut(start..start + size)
            .ok_or_else(|| Error::Corruption(format!("{} runs past its buffer", handle)))
    }

    /// Payload regardless of lock state, for read-only inspection
    ///
    /// The slice is only meaningful until the next allocation.
    pub(crate) fn peek(&self, handle: HeapHandle) -> Option<&[u8]> {
        let (frame, offset) = self.frame_of(handle)?;
        let size = read_header(frame, offset)?.size;
        let start = offset + HEADER_SIZE;
        frame.get(start..start + size)
    }

    /// Current state of the block owned by `handle`
    pub fn state(&self, handle: HeapHandle) -> Option<BlockState> {
        self.handles.get(handle).map(|entry| entry.state)
    }

    /// Payload size of the block owned by `handle`
    ///
    /// May exceed the requested size because of rounding and absorbed
    /// remainders.
    pub fn block_size(&self, handle: HeapHandle) -> Option<usize> {
        let (frame, offset) = self.frame_of(handle)?;
        read_header(frame, offset).map(|h| h.size)
    }

    /// Arena offset of the block, `None` for SYSTEM blocks
    pub fn offset_of(&self, handle: HeapHandle) -> Option<usize> {
        self.handles.get(handle)?.arena_offset()
    }

    /// Total arena size in bytes
    pub fn arena_size(&self) -> usize {
        self.arena.len()
    }

    /// Incrementally maintained counters
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Counters plus handle table and arena sizes
    pub fn report(&self) -> HeapReport {
        HeapReport {
            stats: self.stats,
            handles: self.handles.len(),
            bound_handles: self.handles.bound(),
            arena_size: self.arena.len(),
            corruptions: self.corruptions,
        }
    }

    /// Number of damaged frames noticed by lock, unlock, deallocate and
    /// allocation walks
    pub fn corruption_count(&self) -> u64 {
        self.corruptions
    }

    /// Walk the whole heap and compare against the maintained counters
    ///
    /// Checks every arena frame, the handle ↔ block binding of owned arena
    /// blocks, and the frames of SYSTEM blocks.
    pub fn validate(&self) -> Result<()> {
        debug!("Validating heap");

        let mut walked = HeapStats::default();
        for block in BlockWalk::new(&self.arena) {
            let (offset, header, state) =
                block.map_err(|fault| Error::Corruption(format!("{} during validate", fault)))?;

            match state {
                BlockState::Free => {
                    walked.free_blocks += 1;
                    walked.free_size += header.size;
                    continue;
                }
                BlockState::Moveable => {
                    walked.moveable_blocks += 1;
                    walked.moveable_size += header.size;
                }
                BlockState::Locked => {
                    walked.locked_blocks += 1;
                    walked.locked_size += header.size;
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "{} block inside arena at offset {}",
                        other, offset
                    )))
                }
            }

            let bound = header
                .handle()
                .map(HeapHandle::new)
                .and_then(|h| self.handles.get(h));
            match bound {
                Some(entry) if entry.arena_offset() == Some(offset) && entry.state == state => {}
                _ => {
                    return Err(Error::Corruption(format!(
                        "Block at offset {} is not bound to its handle",
                        offset
                    )))
                }
            }
        }

        for (handle, entry) in self.handles.iter() {
            if let BlockLocation::System(frame) = &entry.location {
                let (header, _) = inspect(frame, 0).map_err(|fault| {
                    Error::Corruption(format!("{} in system block {}", fault, handle))
                })?;
                walked.system_blocks += 1;
                walked.system_size += header.size;
            }
        }

        if walked != self.stats {
            return Err(Error::Corruption(format!(
                "Heap counters {:?} disagree with walk {:?}",
                self.stats, walked
            )));
        }

        debug!("Heap is O.K.");
        Ok(())
    }

    /// Find (or make) a FREE arena block of at least `size` bytes
    fn find_free_block(&mut self, size: usize) -> Option<usize> {
        match self.compact_for(size) {
            Ok(found) => found,
            Err(fault) => {
                self.corruptions += 1;
                metrics::counter!("heapcache_heap_corruption_total").increment(1);
                error!(%fault, "Heap corruption detected during allocation");
                None
            }
        }
    }

    fn compact_for(&mut self, size: usize) -> std::result::Result<Option<usize>, WalkFault> {
        if self.stats.free_blocks == 0 {
            return Ok(None);
        }

        let free = build_free_list(&mut self.arena, &mut self.stats)?;
        if let Some(block) = first_fit(&free, size) {
            return Ok(Some(block.offset));
        }

        let extents = build_extents(&self.arena)?;
        if let Some(plan) = plan_evacuation(&self.arena, &free, &extents, size)? {
            metrics::counter!("heapcache_heap_compactions_total").increment(1);
            info!(
                extent = plan.extent.offset,
                moves = plan.moves.len(),
                size,
                "Evacuating moveable extent"
            );
            let offset = evacuate(&mut self.arena, &mut self.handles, &mut self.stats, &plan);
            return Ok(Some(offset));
        }

        if let Some(extent) = plan_slide(&extents, size) {
            metrics::counter!("heapcache_heap_compactions_total").increment(1);
            info!(extent = extent.offset, size, "Sliding moveable extent");
            let offset = slide(&mut self.arena, &mut self.handles, &mut self.stats, &extent)?;
            return Ok(Some(offset));
        }

        Ok(None)
    }

    /// Turn the FREE block at `offset` into a MOVEABLE block of `size` bytes,
    /// splitting off the remainder when it is large enough
    fn bind_free_block(&mut self, offset: usize, size: usize) -> HeapHandle {
        let mut header = read_header(&self.arena, offset)
            .unwrap_or_else(|| BlockHeader::new(size, BlockState::Free, None));
        let remaining = header.size - size;

        if remaining > MIN_BLOCK_SIZE {
            header.size = size;
            let next = offset + size + BLOCK_OVERHEAD;
            write_frame(
                &mut self.arena,
                next,
                &BlockHeader::new(remaining - BLOCK_OVERHEAD, BlockState::Free, None),
            );
            self.stats.free_blocks += 1;
            self.stats.free_size -= BLOCK_OVERHEAD;
        }

        let handle = self.handles.acquire(HandleEntry {
            state: BlockState::Moveable,
            location: BlockLocation::Arena(offset),
        });

        header.set_state(BlockState::Moveable);
        header.handle = handle.index();
        write_frame(&mut self.arena, offset, &header);

        self.stats.free_blocks -= 1;
        self.stats.free_size -= header.size;
        self.stats.moveable_blocks += 1;
        self.stats.moveable_size += header.size;

        handle
    }

    /// Buffer and header offset of a handle's block
    fn frame_of(&self, handle: HeapHandle) -> Option<(&[u8], usize)> {
        match &self.handles.get(handle)?.location {
            BlockLocation::Arena(offset) => Some((self.arena.as_slice(), *offset)),
            BlockLocation::System(frame) => Some((&frame[..], 0)),
        }
    }

    fn locked_frame(&self, handle: HeapHandle) -> Result<(&[u8], usize)> {
        match self.state(handle) {
            None => Err(Error::InvalidHandle(handle.index())),
            Some(state) if !state.is_locked() => {
                Err(Error::Misuse(format!("{} is not locked", handle)))
            }
            Some(_) => self
                .frame_of(handle)
                .ok_or(Error::InvalidHandle(handle.index())),
        }
    }

    /// Record a state change in both the handle and the block header
    fn set_state(&mut self, handle: HeapHandle, state: BlockState) {
        let Some(entry) = self.handles.get_mut(handle) else {
            return;
        };
        entry.state = state;

        let (frame, offset) = match &mut entry.location {
            BlockLocation::Arena(offset) => (self.arena.as_mut_slice(), *offset),
            BlockLocation::System(frame) => (&mut frame[..], 0),
        };
        if let Some(mut header) = read_header(frame, offset) {
            header.set_state(state);
            write_header(frame, offset, &header);
        }
    }

    /// Inspect a handle's frame, logging and counting anything suspicious
    ///
    /// The handle's own state is authoritative for the result. Header faults,
    /// including a header state that disagrees with the handle, are reported
    /// but only `lock` refuses to continue on them.
    fn check_frame(&mut self, handle: HeapHandle, op: &'static str) -> Result<FrameCheck> {
        let state = self
            .handles
            .get(handle)
            .map(|entry| entry.state)
            .ok_or(Error::InvalidHandle(handle.index()))?;

        let inspected = self
            .frame_of(handle)
            .map(|(frame, offset)| inspect(frame, offset));
        let fault = match inspected {
            Some(Ok((header, header_state))) if header_state == state => {
                return Ok(FrameCheck {
                    state,
                    size: header.size,
                    fault: None,
                });
            }
            Some(Ok((_, header_state))) => {
                error!(%handle, op, handle_state = %state, block_state = %header_state,
                    "Mismatched block states");
                FrameFault::StateMismatch
            }
            Some(Err(fault)) => {
                error!(%handle, op, %fault, "Heap corruption detected");
                fault
            }
            None => {
                error!(%handle, op, "Heap corruption detected: block frame is missing");
                FrameFault::Truncated
            }
        };

        self.corruptions += 1;
        metrics::counter!("heapcache_heap_corruption_total").increment(1);

        let size = self
            .frame_of(handle)
            .and_then(|(frame, offset)| read_header(frame, offset))
            .map(|h| h.size)
            .unwrap_or(0);
        Ok(FrameCheck {
            state,
            size,
            fault: Some(fault),
        })
    }

    fn corrupted(&self, handle: HeapHandle, op: &str, fault: FrameFault) -> Error {
        Error::Corruption(format!("{} detected during {} of {}", fault, op, handle))
    }

    #[cfg(test)]
    pub(crate) fn arena_mut(&mut self) -> &mut [u8] {
        &mut self.arena
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        debug!(
            system_blocks = self.stats.system_blocks,
            handles = self.handles.bound(),
            "Releasing heap"
        );
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("arena_size", &self.arena.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Result of [`Heap::check_frame`]
struct FrameCheck {
    state: BlockState,
    size: usize,
    fault: Option<FrameFault>,
}

/// Allocate and frame a SYSTEM block outside the arena
fn system_frame(size: usize) -> Result<Box<[u8]>> {
    let total = size + BLOCK_OVERHEAD;
    let mut frame = Vec::new();
    frame
        .try_reserve_exact(total)
        .map_err(|_| Error::AllocationFailed(size))?;
    frame.resize(total, 0);
    write_frame(&mut frame, 0, &BlockHeader::new(size, BlockState::System, None));
    Ok(frame.into_boxed_slice())
}

/// Per-state block counts and payload totals
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub free_blocks: usize,
    pub free_size: usize,
    pub moveable_blocks: usize,
    pub moveable_size: usize,
    pub locked_blocks: usize,
    pub locked_size: usize,
    pub system_blocks: usize,
    pub system_size: usize,
}

/// Heap statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapReport {
    #[serde(flatten)]
    pub stats: HeapStats,
    /// Length of the handle table
    pub handles: usize,
    /// Handles currently owning a block
    pub bound_handles: usize,
    pub arena_size: usize,
    pub corruptions: u64,
}

impl fmt::Display for HeapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Heap]")?;
        writeln!(f, "Total free blocks: {}", self.stats.free_blocks)?;
        writeln!(f, "Total free size: {}", self.stats.free_size)?;
        writeln!(f, "Total moveable blocks: {}", self.stats.moveable_blocks)?;
        writeln!(f, "Total moveable size: {}", self.stats.moveable_size)?;
        writeln!(f, "Total locked blocks: {}", self.stats.locked_blocks)?;
        writeln!(f, "Total locked size: {}", self.stats.locked_size)?;
        writeln!(f, "Total system blocks: {}", self.stats.system_blocks)?;
        writeln!(f, "Total system size: {}", self.stats.system_size)?;
        writeln!(f, "Total handles: {}", self.handles)?;
        write!(f, "Arena size: {}", self.arena_size)
    }
}
