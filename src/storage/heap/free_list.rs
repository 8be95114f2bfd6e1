//! Arena walks: free list and moveable extents
//!
//! Both lists are rebuilt on demand by walking the block frames from offset 0.
//! The free list build is the only place adjacent FREE blocks are merged.

use super::allocator::HeapStats;
use super::block::{inspect, write_frame, BlockHeader, BlockState, FrameFault, BLOCK_OVERHEAD};
use std::fmt;

/// A frame fault found while walking the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkFault {
    pub offset: usize,
    pub fault: FrameFault,
}

impl fmt::Display for WalkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.fault, self.offset)
    }
}

/// Iterator over the blocks of an arena in address order
///
/// Stops after the first fault, since the next offset is unknown from then on.
pub struct BlockWalk<'a> {
    arena: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> BlockWalk<'a> {
    pub fn new(arena: &'a [u8]) -> Self {
        Self::from_offset(arena, 0)
    }

    pub fn from_offset(arena: &'a [u8], offset: usize) -> Self {
        Self {
            arena,
            offset,
            done: false,
        }
    }
}

impl<'a> Iterator for BlockWalk<'a> {
    type Item = Result<(usize, BlockHeader, BlockState), WalkFault>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.arena.len() {
            return None;
        }

        let offset = self.offset;
        match inspect(self.arena, offset) {
            Ok((header, state)) => {
                self.offset = offset + header.span();
                Some(Ok((offset, header, state)))
            }
            Err(fault) => {
                self.done = true;
                Some(Err(WalkFault { offset, fault }))
            }
        }
    }
}

/// A FREE block found by [`build_free_list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: usize,
    pub size: usize,
}

/// Collect FREE blocks, merging runs of adjacent ones
///
/// Merging rewrites the surviving block's frame and adjusts `stats`: one block
/// fewer and one overhead's worth of extra free payload per merge. The result
/// is sorted ascending by size (ties by address).
pub fn build_free_list(
    arena: &mut [u8],
    stats: &mut HeapStats,
) -> Result<Vec<FreeBlock>, WalkFault> {
    let mut free = Vec::with_capacity(stats.free_blocks);
    let mut offset = 0;

    while offset < arena.len() {
        let (mut header, state) =
            inspect(arena, offset).map_err(|fault| WalkFault { offset, fault })?;

        if state == BlockState::Free {
            let mut merged = false;
            loop {
                let next = offset + header.span();
                if next >= arena.len() {
                    break;
                }
                let (next_header, next_state) =
                    inspect(arena, next).map_err(|fault| WalkFault { offset: next, fault })?;
                if next_state != BlockState::Free {
                    break;
                }

                header.size += next_header.span();
                stats.free_blocks -= 1;
                stats.free_size += BLOCK_OVERHEAD;
                merged = true;
            }

            if merged {
                write_frame(arena, offset, &header);
            }
            free.push(FreeBlock {
                offset,
                size: header.size,
            });
        }

        offset += header.span();
    }

    free.sort_by_key(|block| (block.size, block.offset));
    Ok(free)
}

/// First block in the sorted free list that can hold `size` bytes
pub fn first_fit(free: &[FreeBlock], size: usize) -> Option<FreeBlock> {
    free.iter().find(|block| block.size >= size).copied()
}

/// A maximal run of adjacent FREE/MOVEABLE blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Offset of the first block
    pub offset: usize,
    /// Number of blocks in the run
    pub blocks: usize,
    /// Number of MOVEABLE blocks in the run
    pub moveable: usize,
    /// Sum of payload sizes, framing excluded
    pub size: usize,
    /// Sum of MOVEABLE payload sizes
    pub moveable_size: usize,
}

impl Extent {
    /// Payload of the single FREE block the whole run collapses into
    pub fn merged_size(&self) -> usize {
        self.size + BLOCK_OVERHEAD * (self.blocks - 1)
    }

    /// One past the last byte of the run
    pub fn end(&self) -> usize {
        self.offset + self.merged_size() + BLOCK_OVERHEAD
    }

    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.offset && offset < self.end()
    }

    /// Payload left at the tail after packing the MOVEABLE blocks to the front
    pub fn slid_free_size(&self) -> Option<usize> {
        let packed = self.moveable_size + BLOCK_OVERHEAD * self.moveable;
        (self.end() - self.offset)
            .checked_sub(packed)?
            .checked_sub(BLOCK_OVERHEAD)
    }
}

/// Find all moveable extents, sorted descending by payload size
pub fn build_extents(arena: &[u8]) -> Result<Vec<Extent>, WalkFault> {
    let mut extents: Vec<Extent> = Vec::new();
    let mut current: Option<Extent> = None;

    for block in BlockWalk::new(arena) {
        let (offset, header, state) = block?;

        if !state.is_relocatable() {
            extents.extend(current.take());
            continue;
        }

        let extent = current.get_or_insert(Extent {
            offset,
            blocks: 0,
            moveable: 0,
            size: 0,
            moveable_size: 0,
        });
        extent.blocks += 1;
        extent.size += header.size;
        if state == BlockState::Moveable {
            extent.moveable += 1;
            extent.moveable_size += header.size;
        }
    }
    extents.extend(current);

    extents.sort_by(|a, b| b.size.cmp(&a.size).then(a.offset.cmp(&b.offset)));
    Ok(extents)
}

/// A MOVEABLE block inside an extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveableBlock {
    pub offset: usize,
    pub size: usize,
    pub handle: u32,
}

/// MOVEABLE blocks of `extent` in address order
pub fn extent_blocks(arena: &[u8], extent: &Extent) -> Result<Vec<MoveableBlock>, WalkFault> {
    let mut blocks = Vec::with_capacity(extent.moveable);

    for block in BlockWalk::from_offset(arena, extent.offset).take(extent.blocks) {
        let (offset, header, state) = block?;
        if state != BlockState::Moveable {
            continue;
        }
        match header.handle() {
            Some(handle) => blocks.push(MoveableBlock {
                offset,
                size: header.size,
                handle,
            }),
            None => {
                return Err(WalkFault {
                    offset,
                    fault: FrameFault::BadState,
                })
            }
        }
    }

    Ok(blocks)
}
