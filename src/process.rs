use crate::page::PageId;
use crate::paging::PageTable;

pub type Pid = u16;

/// A managed process: its page table and the ordered list of pages mapped
/// into its arena. The arena grows only at the high end, so `pages.len()` is
/// the mapped prefix length.
pub struct Process {
    pub pid: Pid,
    pub page_table: PageTable,
    pub pages: Vec<PageId>,
}

impl Process {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            page_table: PageTable::default(),
            pages: Vec::new(),
        }
    }

    pub fn mapped_count(&self) -> usize {
        self.pages.len()
    }
}
