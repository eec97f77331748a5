//! Platform primitives selected at build time

use std::fs::File;
use std::io;

/// Windows maps views on 64 KiB boundaries regardless of page size.
#[cfg(not(unix))]
const WINDOWS_ALLOCATION_GRANULARITY: usize = 64 * 1024;

/// Fallback when the OS refuses to report a page size.
#[cfg(unix)]
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Smallest unit the OS will map at an arbitrary file offset
#[cfg(unix)]
pub fn allocation_granularity() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        FALLBACK_PAGE_SIZE
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
pub fn allocation_granularity() -> usize {
    WINDOWS_ALLOCATION_GRANULARITY
}

/// Close a file handle and report what the OS said about it.
///
/// Dropping a `File` discards the close(2) result, so on unix the descriptor
/// is released by hand.
#[cfg(unix)]
pub fn close_file(file: File) -> io::Result<()> {
    use std::os::unix::io::IntoRawFd;

    let fd = file.into_raw_fd();
    // SAFETY: `fd` came from `into_raw_fd`, so we are its sole owner.
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn close_file(file: File) -> io::Result<()> {
    drop(file);
    Ok(())
}
