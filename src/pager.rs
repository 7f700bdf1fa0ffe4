use crate::error::{PagerError, Result};
use crate::mem::clock::ClockQueue;
use crate::mem::frame_pool::FramePool;
use crate::mem::swap_pool::SwapPool;
use crate::mem::{PhysMem, ARENA_SIZE, PAGE_SIZE, ZERO_FRAME};
use crate::page::{Backing, PageId, VirtualPage};
use crate::paging::{arena_addr, arena_index, PageTable, PageTableEntry, ARENA_PAGES};
use crate::process::{Pid, Process};
use crate::storage::BackingStore;
use log::{debug, trace};
use std::collections::BTreeMap;

/// The external pager.
///
/// Owns every piece of process-wide paging state: the simulated physical
/// memory, the frame and swap pools, the clock queue, the page descriptors
/// and the process registry. The MMU host drives it through
/// [`create`](Pager::create), [`switch`](Pager::switch),
/// [`fault`](Pager::fault), [`map`](Pager::map) and
/// [`destroy`](Pager::destroy), and consults the current process's page
/// table via [`active_table`](Pager::active_table) on every access.
pub struct Pager<S: BackingStore> {
    store: S,
    phys: PhysMem,
    frames: FramePool,
    swap: SwapPool,
    clock: ClockQueue,
    pages: BTreeMap<PageId, VirtualPage>,
    next_page: PageId,
    processes: BTreeMap<Pid, Process>,
    current: Option<Pid>,
}

fn read_backing<S: BackingStore>(store: &mut S, name: Option<&str>, block: usize, buf: &mut [u8]) {
    if let Err(err) = store.read_block(name, block, buf) {
        panic!("backing store read ({name:?}, {block}) failed: {err}");
    }
}

fn write_backing<S: BackingStore>(store: &mut S, name: Option<&str>, block: usize, buf: &[u8]) {
    if let Err(err) = store.write_block(name, block, buf) {
        panic!("backing store write ({name:?}, {block}) failed: {err}");
    }
}

impl<S: BackingStore> Pager<S> {
    /// Set up a pager over `memory_pages` physical frames and `swap_blocks`
    /// swap blocks. Frame 0 is pinned as the all-zeros frame.
    pub fn new(store: S, memory_pages: usize, swap_blocks: usize) -> Self {
        Self {
            store,
            phys: PhysMem::new(memory_pages),
            frames: FramePool::new(memory_pages),
            swap: SwapPool::new(swap_blocks),
            clock: ClockQueue::new(),
            pages: BTreeMap::new(),
            next_page: 0,
            processes: BTreeMap::new(),
            current: None,
        }
    }

    /// Register `child`. When `parent` is managed, the child inherits a deep
    /// copy of the page table and a shallow share of every page descriptor;
    /// write permission is stripped from both tables so the next writer
    /// faults and splits. Fails without side effects when the swap area
    /// cannot cover the inherited swap-backed pages.
    pub fn create(&mut self, parent: Pid, child: Pid) -> Result<()> {
        if self.processes.contains_key(&child) {
            return Err(PagerError::ProcessExists);
        }
        let (mut page_table, pages) = match self.processes.get(&parent) {
            None => {
                debug!("create: process {child} with an empty arena");
                self.processes.insert(child, Process::new(child));
                return Ok(());
            }
            Some(parent) => (parent.page_table.clone(), parent.pages.clone()),
        };

        // Every share of a swap-backed page holds its own block reservation,
        // so a later copy-on-write split can never run out of swap.
        let swap_pages = pages
            .iter()
            .filter(|&id| self.pages[id].is_swap_backed())
            .count();
        if !self.swap.reserve_many(swap_pages) {
            return Err(PagerError::SwapExhausted);
        }

        for index in 0..pages.len() {
            page_table[index] = page_table[index].with_write_enable(false);
        }
        let parent_proc = self
            .processes
            .get_mut(&parent)
            .expect("parent vanished during create");
        for index in 0..parent_proc.pages.len() {
            parent_proc.page_table[index] = parent_proc.page_table[index].with_write_enable(false);
        }
        for (index, id) in pages.iter().enumerate() {
            self.pages
                .get_mut(id)
                .expect("process slot references dead page")
                .sharers
                .push((child, index));
        }
        debug!("create: process {child} cloned from {parent} ({} pages)", pages.len());
        self.processes.insert(
            child,
            Process {
                pid: child,
                page_table,
                pages,
            },
        );
        self.debug_check();
        Ok(())
    }

    /// Make `pid`'s page table the one the MMU consults.
    pub fn switch(&mut self, pid: Pid) {
        assert!(
            self.processes.contains_key(&pid),
            "switch to unregistered process {pid}"
        );
        self.current = Some(pid);
    }

    /// Tear down the current process: drop its share of every page, release
    /// frames and swap blocks nobody else references, and prune the clock
    /// queue. Leaves no process current.
    pub fn destroy(&mut self) {
        let pid = self.current.take().expect("destroy with no current process");
        let process = self
            .processes
            .remove(&pid)
            .expect("current process not registered");
        debug!("destroy: process {pid} ({} pages)", process.pages.len());
        for (index, id) in process.pages.iter().enumerate() {
            let page = self
                .pages
                .get_mut(id)
                .expect("process slot references dead page");
            page.sharers.retain(|&sharer| sharer != (pid, index));
            if page.is_swap_backed() {
                self.swap.unreserve();
            }
            let orphaned = page.sharers.is_empty();
            if orphaned {
                if page.resident {
                    let frame = page.frame.expect("resident page without a frame");
                    if frame != ZERO_FRAME {
                        self.frames.release(frame);
                        self.clock.remove(*id);
                    }
                }
                if let Backing::Swap { block: Some(block) } = page.backing {
                    self.swap.release(block);
                }
                self.pages.remove(id);
            }
        }
        self.debug_check();
    }

    /// Resolve an access fault at `addr`. Returns `InvalidAccess` when the
    /// address lies outside the current process's mapped arena; otherwise the
    /// page is brought in (evicting as needed), copy-on-write splits are
    /// performed, and the page-table permissions are raised so the faulting
    /// access can retry.
    pub fn fault(&mut self, addr: usize, write: bool) -> Result<()> {
        let pid = self.current.expect("fault with no current process");
        let index = arena_index(addr).ok_or(PagerError::InvalidAccess)?;
        if index >= self.processes[&pid].mapped_count() {
            return Err(PagerError::InvalidAccess);
        }
        trace!(
            "{} fault at {addr:#x} (process {pid}, page {index})",
            if write { "write" } else { "read" }
        );
        if write {
            self.write_fault(pid, index);
        } else {
            self.read_fault(pid, index);
        }
        self.debug_check();
        Ok(())
    }

    fn read_fault(&mut self, pid: Pid, index: usize) {
        let id = self.processes[&pid].pages[index];
        if !self.pages[&id].resident {
            self.install(pid, index);
        }
        let page = self
            .pages
            .get_mut(&id)
            .expect("process slot references dead page");
        page.referenced = true;
        // A sole-owned page that is already dirty need not trap the next
        // write just to set a bit that is already set.
        let grant_write = page.dirty && page.share_count() == 1;
        let process = self.processes.get_mut(&pid).expect("process vanished");
        let entry = process.page_table[index].with_read_enable(true);
        process.page_table[index] = if grant_write {
            entry.with_write_enable(true)
        } else {
            entry
        };
    }

    fn write_fault(&mut self, pid: Pid, index: usize) {
        let mut id = self.processes[&pid].pages[index];
        if self.pages[&id].share_count() > 1 {
            id = self.split_cow(pid, index, id);
        } else if !self.pages[&id].resident || self.pages[&id].zero_filled {
            // A write always materialises the page out of the zero frame
            // into a private one.
            self.install(pid, index);
        }
        let page = self
            .pages
            .get_mut(&id)
            .expect("process slot references dead page");
        page.dirty = true;
        page.zero_filled = false;
        page.referenced = true;
        let process = self.processes.get_mut(&pid).expect("process vanished");
        process.page_table[index] = process.page_table[index]
            .with_read_enable(true)
            .with_write_enable(true);
    }

    /// Detach the current process's slot from a shared descriptor and give
    /// it a private, resident copy of the sharers' current bytes. The copy
    /// never inherits a swap block; its own is assigned lazily at its first
    /// dirty eviction.
    fn split_cow(&mut self, pid: Pid, index: usize, old_id: PageId) -> PageId {
        let old = self
            .pages
            .get_mut(&old_id)
            .expect("process slot references dead page");
        old.sharers.retain(|&sharer| sharer != (pid, index));
        let zero_filled = old.zero_filled;
        let backing = match &old.backing {
            Backing::Swap { .. } => Backing::Swap { block: None },
            Backing::File { name, block } => Backing::File {
                name: name.clone(),
                block: *block,
            },
        };
        let new_id = self.next_page;
        self.next_page += 1;
        self.pages.insert(
            new_id,
            VirtualPage {
                backing,
                resident: false,
                dirty: false,
                referenced: false,
                zero_filled,
                frame: None,
                sharers: vec![(pid, index)],
            },
        );
        self.processes
            .get_mut(&pid)
            .expect("process vanished")
            .pages[index] = new_id;
        debug!("copy-on-write split of page {old_id} for process {pid} (slot {index})");

        let frame = self.obtain_frame();
        // The eviction scan above may have taken the old page's frame, in
        // which case its bytes were just written back; read them from there.
        let old = &self.pages[&old_id];
        if zero_filled {
            self.phys.frame_mut(frame).fill(0);
        } else if old.resident {
            let src = old.frame.expect("resident page without a frame");
            self.phys.copy_frame(src, frame);
        } else {
            let (name, block) = old.locator();
            read_backing(&mut self.store, name, block, self.phys.frame_mut(frame));
        }
        self.enroll(pid, index, new_id, frame);
        new_id
    }

    /// Bring the page at `index` into a frame and record it in the clock
    /// queue, filling it from the zero frame or its backing locator.
    fn install(&mut self, pid: Pid, index: usize) {
        let id = self.processes[&pid].pages[index];
        let frame = self.obtain_frame();
        let page = &self.pages[&id];
        if page.zero_filled {
            self.phys.frame_mut(frame).fill(0);
        } else {
            let (name, block) = page.locator();
            read_backing(&mut self.store, name, block, self.phys.frame_mut(frame));
        }
        self.enroll(pid, index, id, frame);
    }

    fn enroll(&mut self, pid: Pid, index: usize, id: PageId, frame: usize) {
        let page = self
            .pages
            .get_mut(&id)
            .expect("process slot references dead page");
        page.resident = true;
        page.frame = Some(frame);
        self.frames.mark(frame, true);
        let process = self.processes.get_mut(&pid).expect("process vanished");
        process.page_table[index] = process.page_table[index].with_frame_number(frame);
        self.clock.push(id);
    }

    /// A free frame, or the one vacated by the second-chance victim.
    fn obtain_frame(&mut self) -> usize {
        if let Some(frame) = self.frames.allocate() {
            return frame;
        }
        trace!("no free frame; scanning {} resident pages", self.clock.len());
        // Every rotation clears one reference bit, so at most one full
        // traversal separates us from a victim.
        loop {
            let head = self
                .clock
                .peek()
                .expect("eviction found no candidate");
            let page = self
                .pages
                .get_mut(&head)
                .expect("clock queue references dead page");
            if page.referenced {
                page.referenced = false;
                for &(pid, index) in &page.sharers {
                    let process = self.processes.get_mut(&pid).expect("sharer vanished");
                    process.page_table[index] = process.page_table[index].invalidated();
                }
                self.clock.rotate();
                continue;
            }
            let frame = page.frame.expect("resident page without a frame");
            if page.dirty {
                let (name, block) = match &mut page.backing {
                    Backing::Swap { block } => {
                        let assigned = match *block {
                            Some(block) => block,
                            None => {
                                let fresh = self
                                    .swap
                                    .allocate()
                                    .expect("swap reservation accounting broken");
                                *block = Some(fresh);
                                fresh
                            }
                        };
                        (None, assigned)
                    }
                    Backing::File { name, block } => (Some(name.as_str()), *block),
                };
                debug!("evicting dirty page {head} from frame {frame} to ({name:?}, {block})");
                write_backing(&mut self.store, name, block, self.phys.frame(frame));
            } else {
                debug!("evicting clean page {head} from frame {frame}");
            }
            for &(pid, index) in &page.sharers {
                let process = self.processes.get_mut(&pid).expect("sharer vanished");
                process.page_table[index] = process.page_table[index].invalidated();
            }
            page.resident = false;
            page.dirty = false;
            page.frame = None;
            self.clock.pop();
            // The frame stays marked used; the caller adopts it directly.
            return frame;
        }
    }

    /// Grow the current process's arena by one page and return its address.
    ///
    /// With no `filename` the page is swap-backed: it starts zero-filled on
    /// the pinned zero frame and reserves one swap block. With a `filename`
    /// — an address in the caller's own arena naming the file — the page is
    /// file-backed at `block` and the first touch file-ins.
    pub fn map(&mut self, filename: Option<usize>, block: usize) -> Result<usize> {
        let pid = self.current.expect("map with no current process");
        let index = self.processes[&pid].mapped_count();
        if index >= ARENA_PAGES {
            return Err(PagerError::ArenaFull);
        }
        debug_assert!(index * PAGE_SIZE < ARENA_SIZE);

        let page = match filename {
            None => {
                if !self.swap.reserve() {
                    return Err(PagerError::SwapExhausted);
                }
                VirtualPage::new_swap(pid, index)
            }
            Some(name_addr) => {
                let name = self.resolve_filename(pid, name_addr)?;
                VirtualPage::new_file(pid, index, name, block)
            }
        };
        let entry = if page.zero_filled {
            PageTableEntry::default()
                .with_frame_number(ZERO_FRAME)
                .with_read_enable(true)
        } else {
            PageTableEntry::default()
        };

        let id = self.next_page;
        self.next_page += 1;
        trace!("map: process {pid} slot {index} -> page {id}");
        self.pages.insert(id, page);
        let process = self.processes.get_mut(&pid).expect("process vanished");
        process.pages.push(id);
        process.page_table[index] = entry;
        self.debug_check();
        Ok(arena_addr(index))
    }

    /// The filename argument of a file-backed `map` lives in the caller's
    /// own arena and may itself be paged out. Fault it in when unreadable,
    /// then copy the NUL-terminated name out of the frame that holds it.
    fn resolve_filename(&mut self, pid: Pid, name_addr: usize) -> Result<String> {
        let name_index = arena_index(name_addr).ok_or(PagerError::InvalidAccess)?;
        if name_index >= self.processes[&pid].mapped_count() {
            return Err(PagerError::InvalidAccess);
        }
        if !self.processes[&pid].page_table[name_index].read_enable() {
            self.fault(name_addr, false)?;
        }
        let frame = self.processes[&pid].page_table[name_index].frame_number();
        let bytes = self.phys.frame(frame);
        let offset = (name_addr - arena_addr(name_index)) % PAGE_SIZE;
        let tail = &bytes[offset..];
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    /// The page table the MMU consults for the current process.
    pub fn active_table(&self) -> &PageTable {
        let pid = self.current.expect("no current process");
        &self.processes[&pid].page_table
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn physmem(&self) -> &[u8] {
        self.phys.as_slice()
    }

    pub fn physmem_mut(&mut self) -> &mut [u8] {
        self.phys.as_mut_slice()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Number of occupied frames, the pinned zero frame included.
    pub fn frames_used(&self) -> usize {
        self.frames.used_count()
    }

    pub fn swap_blocks_used(&self) -> usize {
        self.swap.used_count()
    }

    /// Whether the current process's page at `addr` is resident (the pinned
    /// zero frame counts). False for unmapped addresses.
    pub fn is_resident(&self, addr: usize) -> bool {
        let pid = self.current.expect("no current process");
        let Some(index) = arena_index(addr) else {
            return false;
        };
        let process = &self.processes[&pid];
        match process.pages.get(index) {
            Some(id) => self.pages[id].resident,
            None => false,
        }
    }

    fn debug_check(&self) {
        if cfg!(debug_assertions) {
            self.check_invariants();
        }
    }

    /// Panic if any cross-structure invariant is broken. Run after every
    /// public operation in debug builds; tests call it directly.
    pub fn check_invariants(&self) {
        use std::collections::BTreeSet;

        // Frame occupancy matches residency, and no frame is shared.
        let mut resident_frames = BTreeSet::new();
        resident_frames.insert(ZERO_FRAME);
        for (id, page) in &self.pages {
            assert!(!page.sharers.is_empty(), "page {id} has no sharers");
            if page.resident {
                let frame = page.frame.expect("resident page without a frame");
                if frame != ZERO_FRAME {
                    assert!(
                        resident_frames.insert(frame),
                        "frame {frame} held by two resident pages"
                    );
                }
            } else {
                assert!(page.frame.is_none(), "non-resident page {id} keeps a frame");
            }
            if page.zero_filled {
                assert!(!page.dirty, "zero-filled page {id} is dirty");
                assert!(
                    matches!(page.backing, Backing::Swap { block: None }),
                    "zero-filled page {id} holds a swap block"
                );
            }
        }
        for frame in 0..self.frames.capacity() {
            assert_eq!(
                self.frames.is_used(frame),
                resident_frames.contains(&frame),
                "frame pool and residency disagree on frame {frame}"
            );
        }

        // The clock queue holds exactly the resident pages off the zero frame.
        let mut in_clock: Vec<PageId> = self.clock.iter().collect();
        in_clock.sort_unstable();
        in_clock.windows(2).for_each(|pair| {
            assert_ne!(pair[0], pair[1], "page {} enrolled twice", pair[0]);
        });
        let resident: Vec<PageId> = self
            .pages
            .iter()
            .filter(|(_, page)| page.resident && page.frame != Some(ZERO_FRAME))
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(in_clock, resident, "clock queue out of sync with residency");

        // Page tables agree with the descriptors they mirror.
        for (pid, process) in &self.processes {
            assert_eq!(*pid, process.pid, "process registered under the wrong pid");
            for (index, id) in process.pages.iter().enumerate() {
                let page = self.pages.get(id).expect("slot references dead page");
                assert!(
                    page.sharers.contains(&(*pid, index)),
                    "page {id} does not list sharer ({pid}, {index})"
                );
                let entry = process.page_table[index];
                if entry.write_enable() {
                    assert_eq!(page.share_count(), 1, "writable entry on shared page {id}");
                    assert!(page.resident, "writable entry on non-resident page {id}");
                }
                if entry.read_enable() || entry.write_enable() {
                    assert!(page.resident, "enabled entry on non-resident page {id}");
                    assert_eq!(
                        entry.frame_number(),
                        page.frame.expect("resident page without a frame"),
                        "page table frame out of date for page {id}"
                    );
                }
            }
        }
        for (id, page) in &self.pages {
            for &(pid, index) in &page.sharers {
                let process = self.processes.get(&pid).expect("sharer process missing");
                assert_eq!(
                    process.pages.get(index),
                    Some(id),
                    "sharer ({pid}, {index}) does not point back at page {id}"
                );
            }
        }

        // Swap occupancy matches the blocks descriptors hold, and every
        // swap-backed share is covered by a reservation.
        let mut blocks = BTreeSet::new();
        let mut swap_shares = 0;
        for page in self.pages.values() {
            if let Backing::Swap { block } = &page.backing {
                swap_shares += page.share_count();
                if let Some(block) = block {
                    assert!(blocks.insert(*block), "swap block {block} assigned twice");
                }
            }
        }
        for block in 0..self.swap.capacity() {
            assert_eq!(
                self.swap.is_used(block),
                blocks.contains(&block),
                "swap pool and descriptors disagree on block {block}"
            );
        }
        assert_eq!(
            swap_shares,
            self.swap.reserved(),
            "swap reservations out of sync with swap-backed shares"
        );
        assert!(self.swap.used_count() <= self.swap.reserved());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    fn pager(memory_pages: usize, swap_blocks: usize) -> Pager<MemStore> {
        Pager::new(MemStore::new(), memory_pages, swap_blocks)
    }

    #[test]
    fn create_from_unmanaged_parent_is_empty() {
        let mut pager = pager(4, 4);
        pager.create(0, 1).unwrap();
        pager.switch(1);
        assert_eq!(pager.fault(crate::mem::ARENA_BASE, false), Err(PagerError::InvalidAccess));
    }

    #[test]
    fn duplicate_pid_is_rejected() {
        let mut pager = pager(4, 4);
        pager.create(0, 1).unwrap();
        assert_eq!(pager.create(0, 1), Err(PagerError::ProcessExists));
    }

    #[test]
    fn map_fails_when_arena_is_full() {
        let mut pager = pager(4, ARENA_PAGES + 1);
        pager.create(0, 1).unwrap();
        pager.switch(1);
        for _ in 0..ARENA_PAGES {
            pager.map(None, 0).unwrap();
        }
        assert_eq!(pager.map(None, 0), Err(PagerError::ArenaFull));
    }

    #[test]
    fn map_fails_when_swap_is_spoken_for() {
        let mut pager = pager(4, 2);
        pager.create(0, 1).unwrap();
        pager.switch(1);
        pager.map(None, 0).unwrap();
        pager.map(None, 0).unwrap();
        assert_eq!(pager.map(None, 0), Err(PagerError::SwapExhausted));
    }

    #[test]
    fn clone_reserves_swap_for_inherited_pages() {
        let mut pager = pager(4, 3);
        pager.create(0, 1).unwrap();
        pager.switch(1);
        pager.map(None, 0).unwrap();
        pager.map(None, 0).unwrap();
        // Two inherited swap-backed pages would need two more reservations.
        assert_eq!(pager.create(1, 2), Err(PagerError::SwapExhausted));
        // The failed clone charged nothing, so a one-page parent clones fine.
        pager.check_invariants();
        pager.destroy();
        pager.create(0, 3).unwrap();
        pager.switch(3);
        pager.map(None, 0).unwrap();
        pager.create(3, 4).unwrap();
        pager.check_invariants();
    }

    #[test]
    fn destroy_releases_frames_and_blocks() {
        let mut pager = pager(4, 4);
        pager.create(0, 1).unwrap();
        pager.switch(1);
        let addr = pager.map(None, 0).unwrap();
        pager.fault(addr, true).unwrap();
        assert_eq!(pager.frames_used(), 2);
        pager.destroy();
        assert_eq!(pager.frames_used(), 1);
        assert_eq!(pager.swap_blocks_used(), 0);
        pager.check_invariants();
    }
}
