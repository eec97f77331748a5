//! Reference pairing tests
//!
//! Leak and double-free scenarios for the manual ref/unref API and the
//! scoped guards built on it.

use blockfile_rs::{BlockFile, BlockFileError, INVALID_INDEX};
use tempfile::TempDir;

#[test]
fn test_ref_twice_unref_twice() {
    let dir = TempDir::new().unwrap();
    let mut file = BlockFile::open(dir.path().join("f"), 4096).unwrap();
    let (first, index) = file.allocate_block().unwrap();

    let second = file.ref_block(index).unwrap();
    assert_eq!(first.as_ptr(), second.as_ptr());
    assert_eq!(file.ref_count(index), 2);

    file.unref_block(index);
    assert_eq!(file.mapped_blocks(), 1);
    file.unref_block(index);
    assert_eq!(file.mapped_blocks(), 0);

    // Third unref is a no-op
    file.unref_block(index);
    assert_eq!(file.ref_count(index), 0);
    assert_eq!(file.block_count(), 1);
}

#[test]
fn test_writes_visible_through_every_reference() {
    let dir = TempDir::new().unwrap();
    let mut file = BlockFile::open(dir.path().join("f"), 4096).unwrap();
    let (a, index) = file.allocate_block().unwrap();
    let b = file.ref_block(index).unwrap();

    unsafe {
        a.as_mut_slice()[0] = 0x42;
        assert_eq!(b.as_slice()[0], 0x42);
    }

    file.unref_block(index);
    file.unref_block(index);
}

#[test]
fn test_leaked_references_dropped_on_close() {
    let dir = TempDir::new().unwrap();
    let mut file = BlockFile::open(dir.path().join("f"), 4096).unwrap();

    for _ in 0..10 {
        let (_, index) = file.allocate_block().unwrap();
        file.ref_block(index).unwrap();
    }
    assert_eq!(file.mapped_blocks(), 10);

    file.close().unwrap();
    assert_eq!(file.mapped_blocks(), 0);
    for index in 0..10 {
        assert_eq!(file.ref_count(index), 0);
    }
}

#[test]
fn test_guards_leave_nothing_mapped() {
    let dir = TempDir::new().unwrap();
    let mut file = BlockFile::open(dir.path().join("f"), 4096).unwrap();

    for i in 0..20u8 {
        let mut block = file.allocate_pinned().unwrap();
        block[0] = i;
    }
    assert_eq!(file.mapped_blocks(), 0);

    for i in 0..20u32 {
        let block = file.pin(i).unwrap();
        assert_eq!(block[0], i as u8);
    }
    assert_eq!(file.mapped_blocks(), 0);
}

#[test]
fn test_guard_coexists_with_raw_reference() {
    let dir = TempDir::new().unwrap();
    let mut file = BlockFile::open(dir.path().join("f"), 4096).unwrap();
    let (raw, index) = file.allocate_block().unwrap();

    let address = {
        let block = file.pin(index).unwrap();
        block.as_ptr()
    };
    assert_eq!(address, raw.as_ptr() as *const u8);
    assert_eq!(file.ref_count(index), 1);

    file.unref_block(index);
    assert_eq!(file.mapped_blocks(), 0);
}

#[test]
fn test_double_free_does_not_corrupt_free_list() {
    let dir = TempDir::new().unwrap();
    let mut file = BlockFile::open(dir.path().join("f"), 4096).unwrap();
    for _ in 0..3 {
        file.allocate_block().unwrap();
    }

    file.free_block(1).unwrap();
    assert!(matches!(file.free_block(1), Err(BlockFileError::DoubleFree(1))));

    // Mapped again, but still on the free list
    file.ref_block(1).unwrap();
    assert!(matches!(file.free_block(1), Err(BlockFileError::DoubleFree(1))));
    file.unref_block(1);

    assert_eq!(file.free_list_head(), 1);
    let (_, a) = file.allocate_block().unwrap();
    let (_, b) = file.allocate_block().unwrap();
    assert_eq!((a, b), (1, 3));

    // Never referenced since the last unref
    file.unref_block(0);
    assert!(matches!(file.free_block(0), Err(BlockFileError::NotMapped(0))));
    assert_eq!(file.free_list_head(), INVALID_INDEX);
}

#[test]
fn test_double_free_after_reopen_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("f");
    {
        let mut file = BlockFile::open(&path, 4096).unwrap();
        let (_, index) = file.allocate_block().unwrap();
        file.free_block(index).unwrap();
        file.close().unwrap();
    }

    let mut file = BlockFile::open(&path, 4096).unwrap();
    file.ref_block(0).unwrap();
    assert!(matches!(file.free_block(0), Err(BlockFileError::DoubleFree(0))));
    assert_eq!(file.free_list_head(), 0);
    file.unref_block(0);

    let (_, a) = file.allocate_block().unwrap();
    let (_, b) = file.allocate_block().unwrap();
    assert_ne!(a, b, "Block {} handed out twice", a);
    assert_eq!(file.free_list_head(), INVALID_INDEX);
    file.close().unwrap();

    // The on-disk list survived intact too
    let reopened = BlockFile::open(&path, 4096).unwrap();
    assert_eq!(reopened.block_count(), 2);
    assert_eq!(reopened.free_list_head(), INVALID_INDEX);
}

#[test]
fn test_guard_free_of_freed_block_releases_reference() {
    let dir = TempDir::new().unwrap();
    let mut file = BlockFile::open(dir.path().join("f"), 4096).unwrap();
    let block = file.allocate_pinned().unwrap();
    let index = block.index();
    block.free().unwrap();

    let again = file.pin(index).unwrap();
    assert!(matches!(again.free(), Err(BlockFileError::DoubleFree(_))));
    assert_eq!(file.ref_count(index), 0);
}
