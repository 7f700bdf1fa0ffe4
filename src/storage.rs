use crate::mem::PAGE_SIZE;
use std::collections::BTreeMap;
use std::io;

/// Backing-store I/O as the host provides it: page-sized blocks addressed by
/// `(filename, block)`. A `None` filename targets the swap area.
///
/// The pager treats these primitives as infallible; an `Err` is surfaced as
/// a pager abort, not a recoverable condition.
pub trait BackingStore {
    fn read_block(&mut self, name: Option<&str>, block: usize, buf: &mut [u8]) -> io::Result<()>;
    fn write_block(&mut self, name: Option<&str>, block: usize, buf: &[u8]) -> io::Result<()>;
}

/// In-memory backing store for tests and simulation hosts.
///
/// Blocks never written read back as zeros. Every transfer is counted so
/// tests can assert I/O exactly.
#[derive(Default)]
pub struct MemStore {
    swap: BTreeMap<usize, Box<[u8]>>,
    files: BTreeMap<String, BTreeMap<usize, Box<[u8]>>>,
    swap_reads: usize,
    swap_writes: usize,
    file_reads: usize,
    file_writes: usize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate one block of a named file.
    pub fn set_file_block(&mut self, name: &str, block: usize, bytes: &[u8]) {
        assert!(bytes.len() <= PAGE_SIZE, "block larger than a page");
        let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
        page[..bytes.len()].copy_from_slice(bytes);
        self.files
            .entry(name.to_owned())
            .or_default()
            .insert(block, page);
    }

    /// Current contents of a file block, if it has ever been written.
    pub fn file_block(&self, name: &str, block: usize) -> Option<&[u8]> {
        self.files.get(name)?.get(&block).map(|page| &page[..])
    }

    pub fn swap_reads(&self) -> usize {
        self.swap_reads
    }

    pub fn swap_writes(&self) -> usize {
        self.swap_writes
    }

    pub fn file_reads(&self) -> usize {
        self.file_reads
    }

    pub fn file_writes(&self) -> usize {
        self.file_writes
    }
}

impl BackingStore for MemStore {
    fn read_block(&mut self, name: Option<&str>, block: usize, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let page = match name {
            None => {
                self.swap_reads += 1;
                self.swap.get(&block)
            }
            Some(name) => {
                self.file_reads += 1;
                self.files.get(name).and_then(|blocks| blocks.get(&block))
            }
        };
        match page {
            Some(page) => buf.copy_from_slice(page),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&mut self, name: Option<&str>, block: usize, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let blocks = match name {
            None => {
                self.swap_writes += 1;
                &mut self.swap
            }
            Some(name) => {
                self.file_writes += 1;
                self.files.entry(name.to_owned()).or_default()
            }
        };
        blocks.insert(block, buf.to_vec().into_boxed_slice());
        Ok(())
    }
}
