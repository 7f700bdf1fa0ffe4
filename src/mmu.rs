use crate::error::Result;
use crate::mem::{ARENA_BASE, PAGE_SIZE};
use crate::pager::Pager;
use crate::paging::arena_index;
use crate::storage::BackingStore;
use core::ops::{Deref, DerefMut};

/// A minimal MMU simulation driving the pager.
///
/// Every access consults the current process's page table. When the
/// permission bit for the access is clear the MMU delivers a fault to the
/// pager and, if the pager resolves it, retries; otherwise the error is the
/// caller's signal. Dereferences to the wrapped [`Pager`] so hosts call
/// `map`, `create` and friends directly on it.
pub struct Mmu<S: BackingStore> {
    pager: Pager<S>,
}

impl<S: BackingStore> Mmu<S> {
    pub fn new(pager: Pager<S>) -> Self {
        Self { pager }
    }

    pub fn into_inner(self) -> Pager<S> {
        self.pager
    }

    /// Load one byte from `addr` in the current process's arena.
    pub fn read(&mut self, addr: usize) -> Result<u8> {
        if self.translate(addr, false).is_none() {
            self.pager.fault(addr, false)?;
        }
        let at = self
            .translate(addr, false)
            .expect("fault returned ok but left the page unreadable");
        Ok(self.pager.physmem()[at])
    }

    /// Store one byte to `addr` in the current process's arena.
    pub fn write(&mut self, addr: usize, value: u8) -> Result<()> {
        if self.translate(addr, true).is_none() {
            self.pager.fault(addr, true)?;
        }
        let at = self
            .translate(addr, true)
            .expect("fault returned ok but left the page unwritable");
        self.pager.physmem_mut()[at] = value;
        Ok(())
    }

    pub fn write_bytes(&mut self, addr: usize, bytes: &[u8]) -> Result<()> {
        for (offset, &byte) in bytes.iter().enumerate() {
            self.write(addr + offset, byte)?;
        }
        Ok(())
    }

    /// Physical byte index for `addr` when the page table permits the
    /// access, `None` when the MMU would trap.
    fn translate(&self, addr: usize, write: bool) -> Option<usize> {
        let index = arena_index(addr)?;
        let entry = self.pager.active_table()[index];
        let allowed = if write {
            entry.write_enable()
        } else {
            entry.read_enable()
        };
        allowed.then(|| entry.frame_number() * PAGE_SIZE + (addr - ARENA_BASE) % PAGE_SIZE)
    }
}

impl<S: BackingStore> Deref for Mmu<S> {
    type Target = Pager<S>;

    fn deref(&self) -> &Self::Target {
        &self.pager
    }
}

impl<S: BackingStore> DerefMut for Mmu<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.pager
    }
}
