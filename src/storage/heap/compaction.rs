//! Heap compaction
//!
//! When no single FREE block is large enough, the allocator tries to turn a
//! whole moveable extent into one FREE block:
//!
//! ```text
//! before:  [F 40][M 60][F 20][L 16][F 300      ]
//!           └──── extent ────┘      └ target ─┘
//! evacuate: M 60 → target, target remainder split off or absorbed
//! after:   [F 160            ][L 16][M 60][F 220]
//! ```
//!
//! Evacuation needs a FREE block outside the extent for every MOVEABLE block
//! inside it. When that fails the allocator falls back to sliding: MOVEABLE
//! blocks are packed toward the start of their extent and the space they
//! leave behind becomes one trailing FREE block.
//!
//! All scratch lists are built per call.

use super::allocator::HeapStats;
use super::block::{
    read_header, write_footer, write_frame, write_header, BlockHeader, BlockState,
    BLOCK_OVERHEAD, MIN_BLOCK_SIZE,
};
use super::free_list::{extent_blocks, Extent, FreeBlock, MoveableBlock, WalkFault};
use super::handle::HandleTable;
use tracing::debug;

/// One planned move of a MOVEABLE block into a reserved FREE block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub block: MoveableBlock,
    pub target: FreeBlock,
}

/// An extent that can be fully evacuated, with its reservations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvacuationPlan {
    pub extent: Extent,
    pub moves: Vec<Relocation>,
}

/// Find the first extent (largest first) that can be evacuated to make room
/// for `size` bytes
///
/// `free` must be the sorted free list. Each MOVEABLE block, smallest first,
/// reserves the first unreserved FREE block outside the extent that is at
/// least as large.
pub fn plan_evacuation(
    arena: &[u8],
    free: &[FreeBlock],
    extents: &[Extent],
    size: usize,
) -> Result<Option<EvacuationPlan>, WalkFault> {
    let largest_free = free.last().map(|block| block.size).unwrap_or(0);

    'extents: for extent in extents {
        if extent.moveable == 0 || extent.merged_size() < size {
            continue;
        }

        let mut blocks = extent_blocks(arena, extent)?;
        blocks.sort_by_key(|block| (block.size, block.offset));

        let mut reserved = vec![false; free.len()];
        let mut moves = Vec::with_capacity(blocks.len());

        for block in blocks {
            if block.size > largest_free {
                continue 'extents;
            }

            let target = free.iter().enumerate().find(|(index, candidate)| {
                candidate.size >= block.size
                    && !extent.contains(candidate.offset)
                    && !reserved[*index]
            });

            match target {
                Some((index, candidate)) => {
                    reserved[index] = true;
                    moves.push(Relocation {
                        block,
                        target: *candidate,
                    });
                }
                None => continue 'extents,
            }
        }

        return Ok(Some(EvacuationPlan {
            extent: *extent,
            moves,
        }));
    }

    Ok(None)
}

/// Carry out an evacuation plan
///
/// Returns the offset of the FREE block the extent collapsed into.
pub fn evacuate(
    arena: &mut [u8],
    handles: &mut HandleTable,
    stats: &mut HeapStats,
    plan: &EvacuationPlan,
) -> usize {
    for Relocation { block, target } in &plan.moves {
        let span = block.size + BLOCK_OVERHEAD;
        arena.copy_within(block.offset..block.offset + span, target.offset);
        handles.relocate(block.handle, target.offset);

        // The reserved FREE block is consumed by the moved block
        stats.free_blocks -= 1;
        stats.free_size -= target.size;

        let remaining = target.size - block.size;
        if remaining == 0 {
            continue;
        }

        if remaining < MIN_BLOCK_SIZE {
            // Too small to stand alone, the moved block absorbs it
            if let Some(mut header) = read_header(arena, target.offset) {
                header.size += remaining;
                write_header(arena, target.offset, &header);
                write_footer(arena, target.offset, header.size);
            }
            stats.moveable_size += remaining;
        } else {
            let tail = target.offset + span;
            write_frame(
                arena,
                tail,
                &BlockHeader::new(remaining - BLOCK_OVERHEAD, BlockState::Free, None),
            );
            stats.free_blocks += 1;
            stats.free_size += remaining - BLOCK_OVERHEAD;
        }

        debug!(
            handle = block.handle,
            from = block.offset,
            to = target.offset,
            size = block.size,
            "Relocated heap block"
        );
    }

    collapse(arena, stats, &plan.extent, plan.extent.offset, 0);
    plan.extent.offset
}

/// Find the first extent (largest first) whose MOVEABLE blocks can be packed
/// to its front leaving at least `size` bytes of trailing FREE payload
pub fn plan_slide(extents: &[Extent], size: usize) -> Option<Extent> {
    extents
        .iter()
        .find(|extent| {
            extent.moveable > 0
                && extent
                    .slid_free_size()
                    .is_some_and(|free_size| free_size >= size)
        })
        .copied()
}

/// Pack the MOVEABLE blocks of `extent` toward its start
///
/// Returns the offset of the trailing FREE block.
pub fn slide(
    arena: &mut [u8],
    handles: &mut HandleTable,
    stats: &mut HeapStats,
    extent: &Extent,
) -> Result<usize, WalkFault> {
    let blocks = extent_blocks(arena, extent)?;
    let mut cursor = extent.offset;

    for block in &blocks {
        let span = block.size + BLOCK_OVERHEAD;
        if block.offset != cursor {
            // Destination is always at or below the source, overlap is fine
            arena.copy_within(block.offset..block.offset + span, cursor);
            handles.relocate(block.handle, cursor);
            debug!(
                handle = block.handle,
                from = block.offset,
                to = cursor,
                size = block.size,
                "Slid heap block"
            );
        }
        cursor += span;
    }

    let packed = cursor - extent.offset;
    collapse(arena, stats, extent, cursor, packed);
    Ok(cursor)
}

/// Replace the FREE blocks of `extent` with a single FREE block at `offset`
/// that runs to the end of the extent
///
/// `packed` is the number of bytes at the front of the extent still occupied
/// by MOVEABLE blocks.
fn collapse(
    arena: &mut [u8],
    stats: &mut HeapStats,
    extent: &Extent,
    offset: usize,
    packed: usize,
) {
    let free_blocks = extent.blocks - extent.moveable;
    let free_payload = extent.size - extent.moveable_size;
    let merged = extent.end() - extent.offset - packed - BLOCK_OVERHEAD;

    stats.free_blocks = stats.free_blocks - free_blocks + 1;
    stats.free_size = stats.free_size - free_payload + merged;

    write_frame(arena, offset, &BlockHeader::new(merged, BlockState::Free, None));
}
