use crate::process::Pid;

pub type PageId = u32;

/// What a page falls back to when it is not resident.
#[derive(Debug, Clone)]
pub enum Backing {
    /// Swap-backed: the block is assigned lazily at the first dirty eviction
    /// and kept for the page's lifetime.
    Swap { block: Option<usize> },
    /// File-backed: dirty evictions write through to this block of the file.
    File { name: String, block: usize },
}

/// Per-page metadata for one arena slot.
///
/// Processes share descriptors after a clone; `sharers` lists every
/// `(process, arena index)` slot that currently references this page, so the
/// eviction scan can invalidate all of their page-table entries.
#[derive(Debug, Clone)]
pub struct VirtualPage {
    pub backing: Backing,
    pub resident: bool,
    pub dirty: bool,
    pub referenced: bool,
    /// The page has never held anything but zeros; reads are served from the
    /// pinned zero frame without touching the backing store.
    pub zero_filled: bool,
    pub frame: Option<usize>,
    pub sharers: Vec<(Pid, usize)>,
}

impl VirtualPage {
    /// A freshly mapped swap-backed page, parked on the pinned zero frame.
    pub fn new_swap(owner: Pid, index: usize) -> Self {
        Self {
            backing: Backing::Swap { block: None },
            resident: true,
            dirty: false,
            referenced: true,
            zero_filled: true,
            frame: Some(crate::mem::ZERO_FRAME),
            sharers: vec![(owner, index)],
        }
    }

    /// A freshly mapped file-backed page; the first touch file-ins.
    pub fn new_file(owner: Pid, index: usize, name: String, block: usize) -> Self {
        Self {
            backing: Backing::File { name, block },
            resident: false,
            dirty: false,
            referenced: false,
            zero_filled: false,
            frame: None,
            sharers: vec![(owner, index)],
        }
    }

    pub fn share_count(&self) -> usize {
        self.sharers.len()
    }

    pub fn is_swap_backed(&self) -> bool {
        matches!(self.backing, Backing::Swap { .. })
    }

    /// The `(filename, block)` pair to read this page from. Panics when a
    /// swap-backed page has no block yet; callers only ask after the page has
    /// been written back at least once.
    pub fn locator(&self) -> (Option<&str>, usize) {
        match &self.backing {
            Backing::Swap { block } => (
                None,
                block.expect("swap-backed page read before any write-back"),
            ),
            Backing::File { name, block } => (Some(name.as_str()), *block),
        }
    }
}
