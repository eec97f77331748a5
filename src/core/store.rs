//! Backing storage for block files
//!
//! The allocator only needs four things from the storage under it: its
//! length, a way to resize it, read-write mappings of arbitrary ranges and a
//! final close. [`FileStore`] provides them over a regular file with
//! memmap2, which already hides the POSIX/Windows mapping differences.

use crate::core::sys;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Storage capability a [`BlockFile`](crate::BlockFile) runs on
pub trait BackingStore {
    /// Current length in bytes
    fn len(&self) -> io::Result<u64>;

    /// Resize to exactly `len` bytes. Must either succeed completely or
    /// leave the length unchanged.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Map `len` bytes starting at `offset` read-write and shared
    fn map(&self, offset: u64, len: usize) -> io::Result<MmapMut>;

    /// Release the underlying handle
    fn close(self) -> io::Result<()>
    where
        Self: Sized;

    /// Location on disk, if there is one
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Regular file on disk
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
}

impl FileStore {
    /// Open `path` read-write, creating an empty file if it does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(FileStore {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl BackingStore for FileStore {
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn map(&self, offset: u64, len: usize) -> io::Result<MmapMut> {
        // SAFETY: the mapping is only reached through the owning BlockFile,
        // which never shrinks the file. Writers in other processes are not
        // guarded against.
        unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&self.file) }
    }

    fn close(self) -> io::Result<()> {
        sys::close_file(self.file)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
