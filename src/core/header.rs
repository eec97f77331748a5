//! On-disk header (block 0) and free-list link codec
//!
//! Every block file starts with a header region. A new file sizes it to the
//! allocation granularity of the host that created it, and the size is
//! recorded in the header so blocks stay at the same offsets when the file is
//! opened on a host with a different page size. Only the first
//! [`HEADER_FIELDS_SIZE`] bytes belong to the allocator; the rest is handed to
//! the caller as the block 0 payload.
//!
//! ```text
//! offset 0   u32 LE  block_size
//! offset 4   u32 LE  block_count       (high-water mark)
//! offset 8   u32 LE  free_block_index  (INVALID_INDEX when empty)
//! offset 12  u32 LE  header_size       (offset of block 0 data)
//! offset 16  ...     block 0 payload
//! ```

use crate::core::error::{BlockFileError, Result};
use std::mem::size_of;

/// Dense block number within one block file
pub type Index = u32;

/// Free-list terminator and "no block" marker
pub const INVALID_INDEX: Index = Index::MAX;

/// Bytes a free block spends on its next-free link
pub const INDEX_SIZE: usize = size_of::<Index>();

const BLOCK_SIZE_OFFSET: usize = 0;
const BLOCK_COUNT_OFFSET: usize = 4;
const FREE_INDEX_OFFSET: usize = 8;
const HEADER_SIZE_OFFSET: usize = 12;

/// Bytes of the header region owned by the allocator
pub const HEADER_FIELDS_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Size of every data block, fixed at creation
    pub block_size: u32,

    /// Number of blocks ever handed out
    pub block_count: u32,

    /// Head of the free list
    pub free_block_index: Index,

    /// Length of the header region, fixed at creation
    pub header_size: u32,
}

impl Header {
    /// Header for a freshly created file
    pub fn new(block_size: u32, header_size: u32) -> Self {
        Header {
            block_size,
            block_count: 0,
            free_block_index: INVALID_INDEX,
            header_size,
        }
    }

    /// Decode the allocator fields from the start of a header region
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_FIELDS_SIZE {
            return Err(BlockFileError::CorruptHeader(format!(
                "header region is {} bytes, need {}",
                buf.len(),
                HEADER_FIELDS_SIZE
            )));
        }

        Ok(Header {
            block_size: read_u32(buf, BLOCK_SIZE_OFFSET),
            block_count: read_u32(buf, BLOCK_COUNT_OFFSET),
            free_block_index: read_u32(buf, FREE_INDEX_OFFSET),
            header_size: read_u32(buf, HEADER_SIZE_OFFSET),
        })
    }

    /// Encode the allocator fields, leaving the payload untouched
    pub fn write_to(&self, buf: &mut [u8]) {
        write_u32(buf, BLOCK_SIZE_OFFSET, self.block_size);
        write_u32(buf, BLOCK_COUNT_OFFSET, self.block_count);
        write_u32(buf, FREE_INDEX_OFFSET, self.free_block_index);
        write_u32(buf, HEADER_SIZE_OFFSET, self.header_size);
    }

    /// Check the header against the caller's request and the file it came from
    pub fn validate(&self, requested_block_size: u32, file_len: u64) -> Result<()> {
        if self.block_size != requested_block_size {
            return Err(BlockFileError::BlockSizeMismatch {
                on_disk: self.block_size,
                requested: requested_block_size,
            });
        }

        if (self.header_size as usize) < HEADER_FIELDS_SIZE {
            return Err(BlockFileError::CorruptHeader(format!(
                "header region of {} bytes cannot hold the allocator fields",
                self.header_size
            )));
        }

        let header_size = self.header_size as u64;
        if file_len < header_size {
            return Err(BlockFileError::FileTooSmall {
                len: file_len,
                required: header_size,
            });
        }

        if self.block_count == INVALID_INDEX {
            return Err(BlockFileError::CorruptHeader(
                "block count overflows the index space".to_string(),
            ));
        }

        let used = self.data_len();
        if header_size + used > file_len {
            return Err(BlockFileError::CorruptHeader(format!(
                "{} blocks of {} bytes do not fit in a {}-byte file",
                self.block_count, self.block_size, file_len
            )));
        }

        if self.free_block_index != INVALID_INDEX && self.free_block_index >= self.block_count {
            return Err(BlockFileError::CorruptHeader(format!(
                "free list head {} is past block count {}",
                self.free_block_index, self.block_count
            )));
        }

        Ok(())
    }

    /// Bytes occupied by allocated blocks
    pub fn data_len(&self) -> u64 {
        self.block_count as u64 * self.block_size as u64
    }

    pub fn has_free_blocks(&self) -> bool {
        self.free_block_index != INVALID_INDEX
    }
}

/// Read the next-free link stored at the start of a free block
pub fn read_free_link(block: &[u8]) -> Index {
    read_u32(block, 0)
}

/// Thread a free block onto the list by overwriting its first bytes
pub fn write_free_link(block: &mut [u8], next: Index) {
    write_u32(block, 0, next);
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
