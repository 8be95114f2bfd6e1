//! Handle table for the heap
//!
//! A handle is a stable index that owns a block regardless of where the
//! block currently lives. Compaction only ever rewrites the table entry, so
//! callers holding a [`HeapHandle`] never observe a relocation.

use super::block::BlockState;
use std::fmt;

/// Number of slots the table starts with and grows by
pub const HANDLE_TABLE_STEP: usize = 64;

/// Stable reference to a heap block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapHandle(u32);

impl HeapHandle {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Index into the handle table
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

/// Where a handle's block currently lives
#[derive(Debug)]
pub(crate) enum BlockLocation {
    /// Byte offset of the block header inside the arena
    Arena(usize),
    /// Separately allocated frame (header, payload, footer)
    System(Box<[u8]>),
}

/// A bound handle slot
#[derive(Debug)]
pub(crate) struct HandleEntry {
    pub state: BlockState,
    pub location: BlockLocation,
}

impl HandleEntry {
    pub fn arena_offset(&self) -> Option<usize> {
        match self.location {
            BlockLocation::Arena(offset) => Some(offset),
            BlockLocation::System(_) => None,
        }
    }
}

/// Growable table of handle slots
///
/// Vacant slots are recycled lowest index first.
#[derive(Debug)]
pub(crate) struct HandleTable {
    slots: Vec<Option<HandleEntry>>,
}

impl HandleTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(HANDLE_TABLE_STEP);
        slots.resize_with(HANDLE_TABLE_STEP, || None);
        Self { slots }
    }

    /// Bind `entry` to the first vacant slot, growing the table if needed
    pub fn acquire(&mut self, entry: HandleEntry) -> HeapHandle {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                let index = self.slots.len();
                self.slots.resize_with(index + HANDLE_TABLE_STEP, || None);
                index
            }
        };

        self.slots[index] = Some(entry);
        HeapHandle::new(index as u32)
    }

    /// Vacate a slot, returning what was bound to it
    pub fn release(&mut self, handle: HeapHandle) -> Option<HandleEntry> {
        self.slots.get_mut(handle.index() as usize)?.take()
    }

    pub fn get(&self, handle: HeapHandle) -> Option<&HandleEntry> {
        self.slots.get(handle.index() as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: HeapHandle) -> Option<&mut HandleEntry> {
        self.slots.get_mut(handle.index() as usize)?.as_mut()
    }

    /// Re-point an arena handle after its block was moved
    pub fn relocate(&mut self, index: u32, offset: usize) -> bool {
        match self.slots.get_mut(index as usize) {
            Some(Some(entry)) => {
                entry.location = BlockLocation::Arena(offset);
                true
            }
            _ => false,
        }
    }

    /// Total number of slots, bound or vacant
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of bound slots
    pub fn bound(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Iterate over bound slots
    pub fn iter(&self) -> impl Iterator<Item = (HeapHandle, &HandleEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (HeapHandle::new(i as u32), e)))
    }
}
