use vm_pager::mem::{ARENA_BASE, PAGE_SIZE};
use vm_pager::{MemStore, Mmu, Pager, PagerError};

fn machine(memory_pages: usize, swap_blocks: usize) -> Mmu<MemStore> {
    Mmu::new(Pager::new(MemStore::new(), memory_pages, swap_blocks))
}

fn total_io(store: &MemStore) -> usize {
    store.swap_reads() + store.swap_writes() + store.file_reads() + store.file_writes()
}

#[test]
fn zero_fill_read_touches_nothing() {
    let mut m = machine(4, 4);
    m.create(0, 1).unwrap();
    m.switch(1);
    let a = m.map(None, 0).unwrap();

    assert_eq!(m.read(a).unwrap(), 0);
    assert_eq!(m.read(a + PAGE_SIZE - 1).unwrap(), 0);

    // Served from the pinned zero frame: no frame allocated, no I/O.
    assert_eq!(m.frames_used(), 1);
    assert_eq!(total_io(m.store()), 0);
    m.check_invariants();
}

#[test]
fn writes_fill_memory_then_evict_once() {
    let mut m = machine(4, 4);
    m.create(0, 1).unwrap();
    m.switch(1);
    let pages: Vec<usize> = (0..4).map(|block| m.map(None, block).unwrap()).collect();
    // Every mapped swap-backed page holds a reservation, so a fifth is
    // refused up front.
    assert_eq!(m.map(None, 4), Err(PagerError::SwapExhausted));

    for &addr in &pages {
        m.write(addr, 0x42).unwrap();
    }
    // Three usable frames, four written pages: exactly one write-back.
    assert_eq!(m.store().swap_writes(), 1);
    assert_eq!(m.frames_used(), 4);

    // Reading the victim pages it back in, displacing another dirty page.
    assert_eq!(m.read(pages[0]).unwrap(), 0x42);
    assert_eq!(m.store().swap_reads(), 1);
    assert_eq!(m.store().swap_writes(), 2);
    m.check_invariants();
}

#[test]
fn copy_on_write_isolates_the_writer() {
    let mut m = machine(4, 4);
    m.create(0, 1).unwrap();
    m.switch(1);
    let a = m.map(None, 0).unwrap();
    m.write(a, 0xAB).unwrap();

    m.create(1, 2).unwrap();
    m.switch(2);
    assert_eq!(m.read(a).unwrap(), 0xAB);

    m.switch(1);
    m.write(a, 0xCD).unwrap();
    assert_eq!(m.read(a).unwrap(), 0xCD);

    m.switch(2);
    assert_eq!(m.read(a).unwrap(), 0xAB);
    m.check_invariants();
}

#[test]
fn file_backed_map_reads_the_named_block() {
    let mut store = MemStore::new();
    let mut block = vec![0u8; PAGE_SIZE];
    block[..5].copy_from_slice(b"hello");
    block[PAGE_SIZE - 1] = 0x7E;
    store.set_file_block("f", 7, &block);

    let mut m = Mmu::new(Pager::new(store, 4, 4));
    m.create(0, 1).unwrap();
    m.switch(1);

    // The filename itself lives in paged memory.
    let a_name = m.map(None, 0).unwrap();
    m.write_bytes(a_name, b"f\0").unwrap();

    let a_file = m.map(Some(a_name), 7).unwrap();
    assert_eq!(m.read(a_file).unwrap(), b'h');
    assert_eq!(m.read(a_file + 4).unwrap(), b'o');
    assert_eq!(m.read(a_file + PAGE_SIZE - 1).unwrap(), 0x7E);
    assert_eq!(m.store().file_reads(), 1);
    m.check_invariants();
}

#[test]
fn dirty_file_pages_write_through_on_eviction() {
    let mut store = MemStore::new();
    store.set_file_block("f", 3, &[0u8; PAGE_SIZE]);

    let mut m = Mmu::new(Pager::new(store, 4, 4));
    m.create(0, 1).unwrap();
    m.switch(1);
    let a_name = m.map(None, 0).unwrap();
    m.write_bytes(a_name, b"f\0").unwrap();
    let a_file = m.map(Some(a_name), 3).unwrap();
    m.write(a_file, 0x99).unwrap();

    // Fill the remaining frame, then keep writing until the file page is
    // the second-chance victim.
    let s1 = m.map(None, 0).unwrap();
    m.write(s1, 1).unwrap();
    let s2 = m.map(None, 0).unwrap();
    m.write(s2, 2).unwrap();
    let s3 = m.map(None, 0).unwrap();
    m.write(s3, 3).unwrap();

    assert!(!m.is_resident(a_file));
    assert_eq!(m.store().file_writes(), 1);
    assert_eq!(m.store().file_block("f", 3).unwrap()[0], 0x99);
    m.check_invariants();
}

#[test]
fn access_outside_the_mapped_arena_is_invalid() {
    let mut m = machine(4, 4);
    m.create(0, 1).unwrap();
    m.switch(1);

    assert_eq!(m.read(ARENA_BASE), Err(PagerError::InvalidAccess));
    assert_eq!(m.write(ARENA_BASE, 1), Err(PagerError::InvalidAccess));
    assert_eq!(m.read(ARENA_BASE - 1), Err(PagerError::InvalidAccess));

    // The first map legalises exactly one page.
    let a = m.map(None, 0).unwrap();
    assert_eq!(m.read(a).unwrap(), 0);
    assert_eq!(m.read(a + PAGE_SIZE), Err(PagerError::InvalidAccess));
}

#[test]
fn second_chance_spares_the_recently_touched() {
    let mut m = machine(4, 4);
    m.create(0, 1).unwrap();
    m.switch(1);
    let a = m.map(None, 0).unwrap();
    let b = m.map(None, 0).unwrap();
    let c = m.map(None, 0).unwrap();
    m.write(a, 0x11).unwrap();
    m.write(b, 0x22).unwrap();
    m.write(c, 0x33).unwrap();

    // The fourth write forces a full rotation (clearing every reference
    // bit) and evicts the FIFO head.
    let d = m.map(None, 0).unwrap();
    m.write(d, 0x44).unwrap();
    assert!(!m.is_resident(a));

    // Touching b re-faults (the scan stripped its permissions) and sets
    // its reference bit again.
    assert_eq!(m.read(b).unwrap(), 0x22);

    // The next eviction rotates past b and takes c, the oldest page left
    // unreferenced.
    assert_eq!(m.read(a).unwrap(), 0x11);
    assert!(!m.is_resident(c));
    assert!(m.is_resident(b));
    assert!(m.is_resident(d));
    assert_eq!(m.store().swap_writes(), 2);
    m.check_invariants();
}

#[test]
fn clone_reads_match_until_either_side_writes() {
    let mut m = machine(8, 8);
    m.create(0, 1).unwrap();
    m.switch(1);
    let a = m.map(None, 0).unwrap();
    let b = m.map(None, 0).unwrap();
    let z = m.map(None, 0).unwrap();
    m.write(a, 0x10).unwrap();
    m.write(b, 0x20).unwrap();

    m.create(1, 2).unwrap();
    m.switch(2);
    assert_eq!(m.read(a).unwrap(), 0x10);
    assert_eq!(m.read(b).unwrap(), 0x20);
    assert_eq!(m.read(z).unwrap(), 0);

    // The child's write is invisible to the parent and vice versa.
    m.write(b, 0x21).unwrap();
    m.switch(1);
    assert_eq!(m.read(b).unwrap(), 0x20);
    m.write(a, 0x11).unwrap();
    m.switch(2);
    assert_eq!(m.read(a).unwrap(), 0x10);
    assert_eq!(m.read(b).unwrap(), 0x21);
    m.check_invariants();
}

#[test]
fn never_written_pages_read_zero_across_evictions() {
    let mut m = machine(4, 8);
    m.create(0, 1).unwrap();
    m.switch(1);
    let z = m.map(None, 0).unwrap();
    // Four written pages over three usable frames guarantee evictions.
    let others: Vec<usize> = (0..4).map(|_| m.map(None, 0).unwrap()).collect();

    // Churn the frame pool hard enough that every private frame turns over.
    for round in 0..3u8 {
        for &addr in &others {
            m.write(addr, round).unwrap();
        }
    }
    assert_eq!(m.read(z).unwrap(), 0);
    // The zero page never joined the churn.
    assert!(m.is_resident(z));
    m.check_invariants();
}

#[test]
fn written_bytes_survive_eviction_and_return() {
    let mut m = machine(4, 4);
    m.create(0, 1).unwrap();
    m.switch(1);
    let pages: Vec<usize> = (0..4).map(|_| m.map(None, 0).unwrap()).collect();
    for (value, &addr) in pages.iter().enumerate() {
        m.write(addr, 0xA0 + value as u8).unwrap();
        m.write(addr + PAGE_SIZE - 1, value as u8).unwrap();
    }
    // Four dirty pages over three usable frames: at least one lives in swap
    // at any moment, yet every read sees the last written bytes.
    for (value, &addr) in pages.iter().enumerate() {
        assert_eq!(m.read(addr).unwrap(), 0xA0 + value as u8);
        assert_eq!(m.read(addr + PAGE_SIZE - 1).unwrap(), value as u8);
    }
    m.check_invariants();
}

#[test]
fn destroy_returns_every_frame_and_block() {
    let mut m = machine(4, 4);
    m.create(0, 1).unwrap();
    m.switch(1);
    let a = m.map(None, 0).unwrap();
    m.write(a, 0xAA).unwrap();
    let b = m.map(None, 0).unwrap();
    m.write(b, 0xBB).unwrap();

    m.create(1, 2).unwrap();
    m.switch(2);
    m.write(a, 0xCC).unwrap();

    // Destroying the child leaves the parent's view intact.
    m.destroy();
    m.switch(1);
    assert_eq!(m.read(a).unwrap(), 0xAA);
    assert_eq!(m.read(b).unwrap(), 0xBB);
    m.check_invariants();

    m.destroy();
    assert_eq!(m.frames_used(), 1);
    assert_eq!(m.swap_blocks_used(), 0);
    m.check_invariants();
}

#[test]
fn mixed_workload_keeps_every_invariant() {
    let mut m = machine(4, 8);
    m.create(0, 1).unwrap();
    m.switch(1);
    let a = m.map(None, 0).unwrap();
    let b = m.map(None, 0).unwrap();
    m.write(a, 1).unwrap();
    m.write(b, 2).unwrap();

    m.create(1, 2).unwrap();
    m.create(1, 3).unwrap();
    m.switch(3);
    m.write(a, 3).unwrap();
    m.switch(2);
    let c = m.map(None, 0).unwrap();
    m.write(c, 4).unwrap();
    m.write(b, 5).unwrap();
    m.check_invariants();

    assert_eq!(m.read(a).unwrap(), 1);
    m.switch(1);
    assert_eq!(m.read(b).unwrap(), 2);
    m.switch(3);
    assert_eq!(m.read(a).unwrap(), 3);
    m.check_invariants();

    m.destroy();
    m.switch(2);
    m.destroy();
    m.switch(1);
    m.destroy();
    assert_eq!(m.frames_used(), 1);
    assert_eq!(m.swap_blocks_used(), 0);
    m.check_invariants();
}
