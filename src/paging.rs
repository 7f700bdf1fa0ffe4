use crate::mem::{ARENA_BASE, ARENA_SIZE, PAGE_SIZE};
use arbitrary_int::u20;
use bitbybit::bitfield;
use core::ops::{Deref, DerefMut};

/// Number of page slots in one arena.
pub const ARENA_PAGES: usize = ARENA_SIZE / PAGE_SIZE;

/// One page-table entry as the MMU consults it: a frame number plus the two
/// permission bits. A clear `read_enable` traps reads, a clear `write_enable`
/// traps writes.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    pub read_enable: bool,
    #[bit(1, rw)]
    pub write_enable: bool,
    #[bits(12..=31, rw)]
    pub frame: u20,
}

impl PageTableEntry {
    pub fn frame_number(&self) -> usize {
        self.frame().value() as usize
    }

    pub fn with_frame_number(self, frame: usize) -> Self {
        self.with_frame(u20::new(frame as u32))
    }

    /// Trap both reads and writes, leaving the stale frame number in place.
    pub fn invalidated(self) -> Self {
        self.with_read_enable(false).with_write_enable(false)
    }
}

/// A process's dense page table, indexed by arena page index.
#[derive(Clone)]
pub struct PageTable([PageTableEntry; ARENA_PAGES]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::default(); ARENA_PAGES])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; ARENA_PAGES];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Arena page index for `addr`, or `None` when it lies outside the arena.
pub fn arena_index(addr: usize) -> Option<usize> {
    if !(ARENA_BASE..ARENA_BASE + ARENA_SIZE).contains(&addr) {
        return None;
    }
    Some((addr - ARENA_BASE) / PAGE_SIZE)
}

/// Base address of arena slot `index`.
pub fn arena_addr(index: usize) -> usize {
    debug_assert!(index < ARENA_PAGES);
    ARENA_BASE + index * PAGE_SIZE
}
