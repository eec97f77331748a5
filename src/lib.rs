//! # blockfile-rs - Persistent Fixed-Size Block Allocator
//!
//! `blockfile-rs` hands out fixed-size blocks from a memory-mapped file and
//! keeps its allocation state in the file itself, so allocations survive a
//! process restart:
//!
//! - **Per-block mappings**, reference counted, one address per live block
//! - **On-file free list** threaded through the freed blocks' own bytes
//! - **On-demand growth** in fixed increments, committed only after the
//!   resize succeeds
//! - **Size-class pool** routing power-of-two sizes to lazily created files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockfile_rs::{BlockFile, Result};
//!
//! # fn main() -> Result<()> {
//! let mut file = BlockFile::open("scratch.blocks", 8192)?;
//!
//! // Guard releases its reference when dropped
//! let index = {
//!     let mut block = file.allocate_pinned()?;
//!     block[..5].copy_from_slice(b"Hello");
//!     block.index()
//! };
//!
//! let block = file.pin(index)?;
//! assert_eq!(&block[..5], b"Hello");
//! drop(block);
//!
//! file.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Pool
//!
//! ```rust,no_run
//! use blockfile_rs::{BlockFilePool, Result};
//!
//! # fn main() -> Result<()> {
//! // Files are named "/tmp/undo-0", "/tmp/undo-1", ... one per size class
//! let mut pool = BlockFilePool::new("/tmp/undo-");
//!
//! let (_ptr, index) = pool.allocate_block(16384)?;
//! pool.free_block(16384, index)?;
//!
//! pool.close()?;
//! pool.clean()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## File Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Header (one allocation granule)             │
//! │  - u32 block_size                           │
//! │  - u32 block_count                          │
//! │  - u32 free_block_index                     │
//! │  - u32 header_size                          │
//! │  - block 0 payload (caller metadata)        │
//! ├─────────────────────────────────────────────┤
//! │ Block 0 .. Block N-1 (block_size each)      │
//! │  - free blocks start with the next free     │
//! │    index (u32::MAX ends the list)           │
//! ├─────────────────────────────────────────────┤
//! │ Reserved growth space                       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! No locking is done internally. Share a [`BlockFile`] or
//! [`BlockFilePool`] between threads only behind your own lock.

pub mod core;

pub use crate::core::{
    block_file::{min_block_size, BlockFile, BlockPtr, BlockRef, DEFAULT_GROWTH_INCREMENT},
    config::{PoolConfig, PoolConfigBuilder, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE},
    error::{BlockFileError, Result},
    header::{Header, Index, INVALID_INDEX},
    pool::BlockFilePool,
    store::{BackingStore, FileStore},
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
