//! Fixed-size block allocator over one memory-mapped file
//!
//! A block file is a header region followed by `block_count` blocks of
//! `block_size` bytes. Freed blocks form a singly linked list threaded
//! through their own first bytes, with the head kept in the header, so the
//! allocator state survives a restart without any side tables.
//!
//! Blocks are mapped on demand, one mapping per block, and reference counted:
//! the first [`BlockFile::ref_block`] maps the block, the matching last
//! [`BlockFile::unref_block`] unmaps it. While any reference is outstanding
//! the same index always resolves to the same address.

use crate::core::error::{BlockFileError, Result};
use crate::core::header::{self, Header, Index, INDEX_SIZE, INVALID_INDEX};
use crate::core::store::{BackingStore, FileStore};
use crate::core::sys;
use memmap2::MmapMut;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Bytes added to the file each time it runs out of reserved blocks
pub const DEFAULT_GROWTH_INCREMENT: u64 = 1024 * 1024;

static MIN_BLOCK_SIZE: OnceLock<usize> = OnceLock::new();

/// Size of the header region, which is the OS mapping granularity.
///
/// Queried once per process.
pub fn min_block_size() -> usize {
    *MIN_BLOCK_SIZE.get_or_init(sys::allocation_granularity)
}

/// Blocks reserved per growth step, never less than one
fn growth_blocks(block_size: u32, growth_increment: u64) -> u64 {
    (growth_increment / block_size as u64).max(1)
}

/// Address and length of a mapped block
///
/// Valid until the reference it came from is released. Dereferencing it is
/// on the caller; [`BlockRef`] is the safe alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPtr {
    ptr: NonNull<u8>,
    len: usize,
}

impl BlockPtr {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The block must stay referenced for `'a`, and no `&mut` view of the
    /// same block may be alive at the same time.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    ///
    /// The block must stay referenced for `'a`, and this must be the only
    /// view of the block while it lives.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

/// Per-block mapping state
#[derive(Default)]
struct BlockSlot {
    map: Option<MmapMut>,
    ref_count: u32,
    /// On the free list
    freed: bool,
}

impl BlockSlot {
    fn ptr(&mut self) -> Option<BlockPtr> {
        let map = self.map.as_mut()?;
        let len = map.len();
        NonNull::new(map.as_mut_ptr()).map(|ptr| BlockPtr { ptr, len })
    }
}

/// Persistent fixed-size block allocator
pub struct BlockFile<S: BackingStore = FileStore> {
    store: Option<S>,
    header_map: Option<MmapMut>,
    header: Header,
    header_size: u64,
    growth_increment: u64,
    slots: Vec<BlockSlot>,
}

impl BlockFile<FileStore> {
    /// Open `path`, creating and initialising it if it does not exist
    pub fn open<P: AsRef<Path>>(path: P, block_size: u32) -> Result<Self> {
        Self::open_with(path, block_size, DEFAULT_GROWTH_INCREMENT)
    }

    /// Like [`open`](Self::open) with an explicit growth increment in bytes
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        block_size: u32,
        growth_increment: u64,
    ) -> Result<Self> {
        let path = path.as_ref();
        let existed = path.exists();
        info!("Opening block file {:?} with {}-byte blocks", path, block_size);

        let store = FileStore::open(path)?;
        Self::from_store(store, block_size, growth_increment).map_err(|e| {
            if !existed {
                // Don't leave a half-initialised file behind
                if let Err(rm) = std::fs::remove_file(path) {
                    warn!("Failed to remove {:?} after failed create: {}", path, rm);
                }
            }
            e
        })
    }
}

impl<S: BackingStore> BlockFile<S> {
    /// Build a block file on top of an arbitrary store.
    ///
    /// An empty store is initialised; anything else must carry a header
    /// matching `block_size`. The store is closed again on failure.
    pub fn from_store(mut store: S, block_size: u32, growth_increment: u64) -> Result<Self> {
        let (header_map, header) = match Self::init(&mut store, block_size, growth_increment) {
            Ok(ready) => ready,
            Err(e) => {
                if let Err(close_err) = store.close() {
                    warn!("Failed to close store after open error: {}", close_err);
                }
                return Err(e);
            }
        };

        let slots = (0..header.block_count).map(|_| BlockSlot::default()).collect();
        let mut file = BlockFile {
            store: Some(store),
            header_map: Some(header_map),
            header,
            header_size: header.header_size as u64,
            growth_increment,
            slots,
        };
        // Dropping `file` on error closes the store
        let free = file.load_free_list()?;
        debug!(
            "Block file ready: {} blocks, {} free, free list head {}",
            header.block_count, free, header.free_block_index
        );
        Ok(file)
    }

    fn init(store: &mut S, block_size: u32, growth_increment: u64) -> Result<(MmapMut, Header)> {
        if (block_size as usize) < INDEX_SIZE {
            return Err(BlockFileError::InvalidBlockSize(block_size as u64));
        }

        let len = store.len()?;

        if len == 0 {
            let header_size = min_block_size() as u64;
            let initial = growth_blocks(block_size, growth_increment)
                .checked_mul(block_size as u64)
                .and_then(|data| data.checked_add(header_size))
                .ok_or(BlockFileError::InvalidBlockSize(block_size as u64))?;
            store.set_len(initial)?;

            let mut map = store.map(0, header_size as usize)?;
            let header = Header::new(block_size, header_size as u32);
            header.write_to(&mut map[..]);
            debug!("Initialised new block file at {} bytes", initial);
            return Ok((map, header));
        }

        let fields = header::HEADER_FIELDS_SIZE as u64;
        if len < fields {
            return Err(BlockFileError::FileTooSmall {
                len,
                required: fields,
            });
        }

        // The header records how long the header region is
        let header = Header::read_from(&store.map(0, header::HEADER_FIELDS_SIZE)?[..])?;
        header.validate(block_size, len)?;
        if header.header_size as usize != min_block_size() {
            debug!(
                "Header region is {} bytes, host granularity is {}",
                header.header_size,
                min_block_size()
            );
        }

        let map = store.map(0, header.header_size as usize)?;
        Ok((map, header))
    }

    /// Mark every block on the on-disk free list as freed.
    ///
    /// Fails on a link past `block_count` or a cycle. Returns the list length.
    fn load_free_list(&mut self) -> Result<u32> {
        let store = self.store.as_ref().ok_or(BlockFileError::Closed)?;
        let mut index = self.header.free_block_index;
        let mut free = 0;

        while index != INVALID_INDEX {
            let offset = self.header_size + index as u64 * self.header.block_size as u64;
            let slot = self.slots.get_mut(index as usize).ok_or_else(|| {
                BlockFileError::CorruptHeader(format!(
                    "free list links to {}, past block count {}",
                    index, self.header.block_count
                ))
            })?;
            if slot.freed {
                return Err(BlockFileError::CorruptHeader(format!(
                    "free list revisits block {}",
                    index
                )));
            }
            slot.freed = true;
            free += 1;

            index = header::read_free_link(&store.map(offset, INDEX_SIZE)?[..]);
        }

        Ok(free)
    }

    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.store.as_ref().and_then(|s| s.path())
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    /// High-water mark of allocated blocks
    pub fn block_count(&self) -> u32 {
        self.header.block_count
    }

    /// Head of the free list, [`INVALID_INDEX`] when empty
    pub fn free_list_head(&self) -> Index {
        self.header.free_block_index
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Blocks the file currently has room for without growing
    pub fn reserved_blocks(&self) -> Result<u64> {
        let store = self.store.as_ref().ok_or(BlockFileError::Closed)?;
        let len = store.len()?;
        Ok(len.saturating_sub(self.header_size) / self.header.block_size as u64)
    }

    /// Outstanding references to `index`, zero when unmapped
    pub fn ref_count(&self, index: Index) -> u32 {
        self.slots
            .get(index as usize)
            .map(|slot| slot.ref_count)
            .unwrap_or(0)
    }

    /// Number of blocks currently mapped
    pub fn mapped_blocks(&self) -> usize {
        self.slots.iter().filter(|slot| slot.map.is_some()).count()
    }

    /// Header bytes past the allocator fields, free for caller metadata
    pub fn header_payload(&self) -> &[u8] {
        match &self.header_map {
            Some(map) => &map[header::HEADER_FIELDS_SIZE..],
            None => &[],
        }
    }

    pub fn header_payload_mut(&mut self) -> &mut [u8] {
        match &mut self.header_map {
            Some(map) => &mut map[header::HEADER_FIELDS_SIZE..],
            None => &mut [],
        }
    }

    fn block_offset(&self, index: Index) -> u64 {
        self.header_size + index as u64 * self.header.block_size as u64
    }

    fn sync_header(&mut self) {
        if let Some(map) = self.header_map.as_mut() {
            self.header.write_to(&mut map[..]);
        }
    }

    /// Take a reference to block `index`, mapping it if needed
    pub fn ref_block(&mut self, index: Index) -> Result<BlockPtr> {
        if index >= self.header.block_count {
            return Err(if self.is_open() {
                BlockFileError::InvalidIndex(index)
            } else {
                BlockFileError::Closed
            });
        }

        let offset = self.block_offset(index);
        let block_size = self.header.block_size as usize;
        let store = self.store.as_ref().ok_or(BlockFileError::Closed)?;
        let slot = &mut self.slots[index as usize];

        if slot.ref_count == 0 {
            slot.map = Some(store.map(offset, block_size)?);
        }
        let ptr = slot.ptr().ok_or(BlockFileError::NotMapped(index))?;
        slot.ref_count += 1;
        Ok(ptr)
    }

    /// Drop a reference, unmapping the block when it was the last one.
    ///
    /// Unknown or unmapped indices are ignored.
    pub fn unref_block(&mut self, index: Index) {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            debug!("Ignoring unref of unknown block {}", index);
            return;
        };

        if slot.ref_count == 0 {
            warn!("Ignoring unref of unmapped block {}", index);
            return;
        }

        slot.ref_count -= 1;
        if slot.ref_count == 0 {
            slot.map = None;
        }
    }

    /// Allocate a block, reusing the most recently freed one if any.
    ///
    /// The block comes back with one reference held by the caller.
    pub fn allocate_block(&mut self) -> Result<(BlockPtr, Index)> {
        if !self.is_open() {
            return Err(BlockFileError::Closed);
        }

        if self.header.has_free_blocks() {
            return self.pop_free_block();
        }

        let index = self.header.block_count;
        if index == INVALID_INDEX {
            return Err(BlockFileError::OutOfSpace);
        }

        self.ensure_capacity(index)?;

        // Commit the count only once the file is big enough
        self.slots.push(BlockSlot::default());
        self.header.block_count = index + 1;
        self.sync_header();

        match self.ref_block(index) {
            Ok(ptr) => {
                debug!("Allocated new block {}", index);
                Ok((ptr, index))
            }
            Err(e) => {
                self.slots.pop();
                self.header.block_count = index;
                self.sync_header();
                Err(e)
            }
        }
    }

    fn pop_free_block(&mut self) -> Result<(BlockPtr, Index)> {
        let index = self.header.free_block_index;
        if index >= self.header.block_count {
            return Err(BlockFileError::CorruptHeader(format!(
                "free list head {} is past block count {}",
                index, self.header.block_count
            )));
        }

        let ptr = self.ref_block(index)?;
        let next = match &self.slots[index as usize].map {
            Some(map) => header::read_free_link(&map[..]),
            None => return Err(BlockFileError::NotMapped(index)),
        };

        if next != INVALID_INDEX && next >= self.header.block_count {
            self.unref_block(index);
            return Err(BlockFileError::CorruptHeader(format!(
                "free block {} links to {}, past block count {}",
                index, next, self.header.block_count
            )));
        }

        self.slots[index as usize].freed = false;
        self.header.free_block_index = next;
        self.sync_header();
        debug!("Reused free block {}, next free {}", index, next);
        Ok((ptr, index))
    }

    /// Make sure the file has room for block `index`, growing it if not
    fn ensure_capacity(&mut self, index: Index) -> Result<()> {
        let block_size = self.header.block_size as u64;
        let header_size = self.header_size;
        let growth = growth_blocks(self.header.block_size, self.growth_increment);
        let store = self.store.as_mut().ok_or(BlockFileError::Closed)?;

        let len = store.len()?;
        let reserved = len.saturating_sub(header_size) / block_size;
        if (index as u64) < reserved {
            return Ok(());
        }

        let target_blocks = (reserved + growth).max(index as u64 + 1);
        let new_len = target_blocks
            .checked_mul(block_size)
            .and_then(|data| data.checked_add(header_size))
            .ok_or(BlockFileError::OutOfSpace)?;

        debug!("Growing block file from {} to {} bytes", len, new_len);
        store.set_len(new_len)?;
        Ok(())
    }

    /// Return block `index` to the free list.
    ///
    /// The block must be referenced. Its first bytes are overwritten with the
    /// free-list link and one reference is released.
    pub fn free_block(&mut self, index: Index) -> Result<()> {
        if !self.is_open() {
            return Err(BlockFileError::Closed);
        }

        let next = self.header.free_block_index;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(BlockFileError::InvalidIndex(index))?;

        if slot.freed || index == next {
            warn!("Double-free detected for block {}", index);
            return Err(BlockFileError::DoubleFree(index));
        }
        if slot.ref_count == 0 {
            warn!("Free of unmapped block {}", index);
            return Err(BlockFileError::NotMapped(index));
        }

        match slot.map.as_mut() {
            Some(map) => header::write_free_link(&mut map[..], next),
            None => return Err(BlockFileError::NotMapped(index)),
        }
        slot.freed = true;

        self.header.free_block_index = index;
        self.sync_header();
        self.unref_block(index);
        debug!("Freed block {}", index);
        Ok(())
    }

    /// Reference `index` for the lifetime of the returned guard
    pub fn pin(&mut self, index: Index) -> Result<BlockRef<'_, S>> {
        let ptr = self.ref_block(index)?;
        Ok(BlockRef {
            file: self,
            index,
            ptr,
            released: false,
        })
    }

    /// Allocate a block and hold its reference in a guard
    pub fn allocate_pinned(&mut self) -> Result<BlockRef<'_, S>> {
        let (ptr, index) = self.allocate_block()?;
        Ok(BlockRef {
            file: self,
            index,
            ptr,
            released: false,
        })
    }

    /// Flush the header and every mapped block to disk
    pub fn flush(&self) -> Result<()> {
        let header_map = self.header_map.as_ref().ok_or(BlockFileError::Closed)?;
        header_map.flush()?;
        for map in self.slots.iter().filter_map(|slot| slot.map.as_ref()) {
            map.flush()?;
        }
        Ok(())
    }

    /// Unmap everything and release the store.
    ///
    /// Outstanding references are dropped regardless of their count. Closing
    /// a closed file is a no-op. Only the store's close result is reported;
    /// memmap2 discards the result of unmapping, so a failed unmap goes
    /// unnoticed.
    pub fn close(&mut self) -> Result<()> {
        let Some(store) = self.store.take() else {
            return Ok(());
        };

        let mapped = self.mapped_blocks();
        if mapped > 0 {
            debug!("Force-unmapping {} referenced blocks on close", mapped);
        }
        self.slots.clear();
        self.header_map = None;

        info!(
            "Closing block file {:?} ({} blocks)",
            store.path(),
            self.header.block_count
        );
        store.close()?;
        Ok(())
    }
}

impl<S: BackingStore> Drop for BlockFile<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close block file on drop: {}", e);
        }
    }
}

/// Scoped reference to one block, released on drop
pub struct BlockRef<'a, S: BackingStore = FileStore> {
    file: &'a mut BlockFile<S>,
    index: Index,
    ptr: BlockPtr,
    released: bool,
}

impl<'a, S: BackingStore> BlockRef<'a, S> {
    pub fn index(&self) -> Index {
        self.index
    }

    /// Free the block instead of just releasing the reference
    pub fn free(mut self) -> Result<()> {
        self.released = true;
        let result = self.file.free_block(self.index);
        if result.is_err() {
            self.file.unref_block(self.index);
        }
        result
    }
}

impl<'a, S: BackingStore> Deref for BlockRef<'a, S> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the guard holds a reference, and the exclusive borrow of the
        // file keeps anyone else from releasing it.
        unsafe { self.ptr.as_slice() }
    }
}

impl<'a, S: BackingStore> DerefMut for BlockRef<'a, S> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes this the only view.
        unsafe { self.ptr.as_mut_slice() }
    }
}

impl<'a, S: BackingStore> Drop for BlockRef<'a, S> {
    fn drop(&mut self) {
        if !self.released {
            self.file.unref_block(self.index);
        }
    }
}
