//! Block framing for the heap arena
//!
//! Every block is laid out as `[header][payload][footer]`:
//!
//! ```text
//! offset ─→ ┌──────────────┬──────────┬──────────┬──────────────┐
//!           │ guard (u32)  │ size u32 │ state u32│ handle (u32) │  header, 16 bytes
//!           ├──────────────┴──────────┴──────────┴──────────────┤
//!           │                  payload (size bytes)             │
//!           ├──────────────┬────────────────────────────────────┘
//!           │ guard (u32)  │                                       footer, 4 bytes
//!           └──────────────┘
//! ```
//!
//! All fields are little-endian. Blocks are addressed by the byte offset of
//! their header inside the arena, or inside their own buffer for SYSTEM blocks.

use std::fmt;

/// Magic value at the start of every block header
pub const HEADER_GUARD: u32 = 0xDEAD_C0DE;

/// Magic value in every block footer
pub const FOOTER_GUARD: u32 = 0xACDC_ACDC;

/// Size of a block header in bytes
pub const HEADER_SIZE: usize = 16;

/// Size of a block footer in bytes
pub const FOOTER_SIZE: usize = 4;

/// Per-block framing overhead
pub const BLOCK_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Smallest remainder worth splitting off as its own free block
pub const MIN_BLOCK_SIZE: usize = 128 + BLOCK_OVERHEAD;

/// Allocation granularity
pub const WORD_SIZE: usize = 4;

/// Handle field value for blocks that are not bound to a handle
pub(crate) const NO_HANDLE: u32 = u32::MAX;

/// Largest payload a block header can describe
pub const MAX_BLOCK_SIZE: usize = (u32::MAX as usize - BLOCK_OVERHEAD) & !(WORD_SIZE - 1);

/// Round a requested payload size up to the allocation granularity
///
/// Returns `None` when the rounded size overflows `usize`.
pub fn round_to_word(size: usize) -> Option<usize> {
    let size = size.max(WORD_SIZE);
    Some(size.checked_add(WORD_SIZE - 1)? & !(WORD_SIZE - 1))
}

/// State of a heap block
///
/// The only combined state is `LockedSystem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// Unused space in the arena
    Free,
    /// Owned by a handle, may be relocated by compaction
    Moveable,
    /// Owned by a handle and pinned at its current address
    Locked,
    /// Backed by a separate process allocation, never relocated
    System,
    /// A SYSTEM block that is currently pinned
    LockedSystem,
}

impl BlockState {
    const MOVEABLE_BIT: u32 = 0x01;
    const LOCKED_BIT: u32 = 0x02;
    const SYSTEM_BIT: u32 = 0x04;

    /// Encode as header bit flags
    pub fn to_bits(self) -> u32 {
        match self {
            BlockState::Free => 0,
            BlockState::Moveable => Self::MOVEABLE_BIT,
            BlockState::Locked => Self::LOCKED_BIT,
            BlockState::System => Self::SYSTEM_BIT,
            BlockState::LockedSystem => Self::LOCKED_BIT | Self::SYSTEM_BIT,
        }
    }

    /// Decode header bit flags, `None` for combinations that never occur
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(BlockState::Free),
            Self::MOVEABLE_BIT => Some(BlockState::Moveable),
            Self::LOCKED_BIT => Some(BlockState::Locked),
            Self::SYSTEM_BIT => Some(BlockState::System),
            b if b == Self::LOCKED_BIT | Self::SYSTEM_BIT => Some(BlockState::LockedSystem),
            _ => None,
        }
    }

    /// Whether the payload address is currently pinned
    pub fn is_locked(self) -> bool {
        matches!(self, BlockState::Locked | BlockState::LockedSystem)
    }

    /// Whether the block lives outside the arena
    pub fn is_system(self) -> bool {
        matches!(self, BlockState::System | BlockState::LockedSystem)
    }

    /// Whether compaction may treat the block as part of an extent
    pub fn is_relocatable(self) -> bool {
        matches!(self, BlockState::Free | BlockState::Moveable)
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockState::Free => "free",
            BlockState::Moveable => "moveable",
            BlockState::Locked => "locked",
            BlockState::System => "system",
            BlockState::LockedSystem => "locked+system",
        };
        f.write_str(name)
    }
}

/// Decoded block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub guard: u32,
    /// Payload size in bytes (framing not included)
    pub size: usize,
    /// Raw state bits, see [`BlockState::from_bits`]
    pub state_bits: u32,
    /// Owning handle index, [`NO_HANDLE`] when unbound
    pub handle: u32,
}

impl BlockHeader {
    /// A fresh header with a valid guard
    pub fn new(size: usize, state: BlockState, handle: Option<u32>) -> Self {
        Self {
            guard: HEADER_GUARD,
            size,
            state_bits: state.to_bits(),
            handle: handle.unwrap_or(NO_HANDLE),
        }
    }

    /// Decoded state, `None` if the bits are garbage
    pub fn state(&self) -> Option<BlockState> {
        BlockState::from_bits(self.state_bits)
    }

    /// Bound handle index
    pub fn handle(&self) -> Option<u32> {
        (self.handle != NO_HANDLE).then_some(self.handle)
    }

    /// Total bytes the block occupies including framing
    pub fn span(&self) -> usize {
        self.size + BLOCK_OVERHEAD
    }

    pub fn set_state(&mut self, state: BlockState) {
        self.state_bits = state.to_bits();
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Read the header at `offset`, `None` if it would run past the buffer
pub fn read_header(buf: &[u8], offset: usize) -> Option<BlockHeader> {
    if offset.checked_add(HEADER_SIZE)? > buf.len() {
        return None;
    }

    Some(BlockHeader {
        guard: read_u32(buf, offset),
        size: read_u32(buf, offset + 4) as usize,
        state_bits: read_u32(buf, offset + 8),
        handle: read_u32(buf, offset + 12),
    })
}

/// Write `header` at `offset`
///
/// Panics if the header does not fit; callers only write inside blocks they
/// already walked.
pub fn write_header(buf: &mut [u8], offset: usize, header: &BlockHeader) {
    write_u32(buf, offset, header.guard);
    write_u32(buf, offset + 4, header.size as u32);
    write_u32(buf, offset + 8, header.state_bits);
    write_u32(buf, offset + 12, header.handle);
}

/// Offset of the footer for a block at `offset` with `size` payload bytes
pub fn footer_offset(offset: usize, size: usize) -> usize {
    offset + HEADER_SIZE + size
}

/// Read the footer guard, `None` if the footer would run past the buffer
pub fn read_footer(buf: &[u8], offset: usize, size: usize) -> Option<u32> {
    let at = footer_offset(offset, size);
    if at.checked_add(FOOTER_SIZE)? > buf.len() {
        return None;
    }
    Some(read_u32(buf, at))
}

pub fn write_footer(buf: &mut [u8], offset: usize, size: usize) {
    write_u32(buf, footer_offset(offset, size), FOOTER_GUARD);
}

/// Write a complete frame (header and footer) for a block
pub fn write_frame(buf: &mut [u8], offset: usize, header: &BlockHeader) {
    write_header(buf, offset, header);
    write_footer(buf, offset, header.size);
}

/// Problems found when inspecting a block frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    /// Header does not fit in the buffer
    Truncated,
    BadHeaderGuard,
    BadFooterGuard,
    /// State bits do not decode
    BadState,
    /// Header state disagrees with the owning handle
    StateMismatch,
}

impl fmt::Display for FrameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFault::Truncated => f.write_str("block frame runs past end of buffer"),
            FrameFault::BadHeaderGuard => f.write_str("bad guard begin"),
            FrameFault::BadFooterGuard => f.write_str("bad guard end"),
            FrameFault::BadState => f.write_str("unknown block state"),
            FrameFault::StateMismatch => f.write_str("mismatched block states"),
        }
    }
}

/// Read and check the frame of the block at `offset`
pub fn inspect(buf: &[u8], offset: usize) -> Result<(BlockHeader, BlockState), FrameFault> {
    let header = read_header(buf, offset).ok_or(FrameFault::Truncated)?;
    if header.guard != HEADER_GUARD {
        return Err(FrameFault::BadHeaderGuard);
    }
    match read_footer(buf, offset, header.size) {
        None => return Err(FrameFault::Truncated),
        Some(guard) if guard != FOOTER_GUARD => return Err(FrameFault::BadFooterGuard),
        Some(_) => {}
    }
    let state = header.state().ok_or(FrameFault::BadState)?;
    Ok((header, state))
}
