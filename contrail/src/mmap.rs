//! Memory-mapped sliding windows.
//!
//! [`MappedFile`] keeps a fixed-size portion of a file mapped into memory and
//! slides the mapping only when a request falls outside of it, so that the
//! common case of appending a few bytes costs no system call at all. Pages
//! dirtied through the mapping are written back by the kernel even if the
//! process dies, which is what makes the trace stream crash consistent
//! without any explicit flushing.
//!
//! [`Window`] is an append cursor layered on top: every write advances its
//! position, remapping transparently when the position crosses the mapped
//! range.

use std::{
    fs::File,
    io,
    os::fd::AsRawFd,
    ptr::{self, NonNull},
    slice,
    sync::atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;

/// Errors that can be occurred by mapping a file into memory.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested size exceeds the configured map window.
    #[error("requested size exceeds the map window")]
    MapTooBig,
    /// The map-ahead hint exceeds the map window.
    #[error("map-ahead hint exceeds the map window")]
    MapAheadTooBig,
    /// Querying the file size failed.
    #[error("stat: {0}")]
    Stat(io::Error),
    /// Growing the file failed.
    #[error("truncate: {0}")]
    Truncate(io::Error),
    /// The `mmap` system call failed.
    #[error("mmap: {0}")]
    Mmap(io::Error),
}

/// A fixed-size mapping that slides along the underlying file.
///
/// The mapping is created lazily on the first [`map`](Self::map) call and
/// moved whenever a requested range falls outside the currently mapped one.
/// The file is grown (never shrunk) to cover the mapped range.
pub struct MappedFile {
    file: File,
    map_size: usize,
    physical_size: usize,
    map_ahead: usize,
    map_offset: u64,
    addr: Option<NonNull<u8>>,
}

impl MappedFile {
    /// Wraps an open file.
    ///
    /// # Arguments
    ///
    /// * `map_size` - the largest range a single [`map`](Self::map) call may
    ///   request. The physical mapping is one page larger, rounded up to a
    ///   page boundary.
    /// * `map_ahead` - placement hint: how much of the window to keep ahead
    ///   of a requested offset when the mapping moves. Must not exceed
    ///   `map_size`.
    pub fn new(file: File, map_size: usize, map_ahead: usize) -> Result<Self, Error> {
        if map_ahead > map_size {
            return Err(Error::MapAheadTooBig);
        }
        let physical_size = round_up_page_size(map_size + page_size());
        Ok(Self { file, map_size, physical_size, map_ahead, map_offset: 0, addr: None })
    }

    /// Makes `[offset, offset + size)` addressable and returns it as a
    /// mutable slice.
    ///
    /// The slice points straight into the mapping; it stays valid until the
    /// next `map` call, which the borrow checker enforces. Requests already
    /// inside the current mapping are satisfied without any system call.
    pub fn map(&mut self, offset: u64, size: usize) -> Result<&mut [u8], Error> {
        if size > self.map_size {
            return Err(Error::MapTooBig);
        }

        if let Some(addr) = self.addr {
            if offset < self.map_offset
                || offset + size as u64 > self.map_offset + self.physical_size as u64
            {
                // The requested range is outside of the current mapping.
                self.unmap(addr);
            }
        }

        if self.addr.is_none() {
            // `map_ahead` is only a hint, the window never exceeds `map_size`.
            let fwd = (size + self.map_ahead).min(self.map_size);
            let back = (self.map_size - fwd) as u64;
            let abs_offset = offset.saturating_sub(back);
            let page_offset = abs_offset - abs_offset % page_size() as u64;
            let end_offset = page_offset + self.physical_size as u64;
            debug_assert!(
                offset + size as u64 <= end_offset,
                "physical size is page-rounded, the request always fits"
            );

            self.ensure_capacity(end_offset)?;

            // SAFETY: A plain shared file mapping over an fd we own; the
            // result is checked against MAP_FAILED before use.
            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    self.physical_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.file.as_raw_fd(),
                    page_offset as libc::off_t,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(Error::Mmap(io::Error::last_os_error()));
            }

            self.map_offset = page_offset;
            // SAFETY: `mmap` returned a valid, non-null address.
            self.addr = Some(unsafe { NonNull::new_unchecked(addr as *mut u8) });
        }

        // SAFETY: a `None` variant for `addr` would have been replaced by a
        // `Some` variant in the code above, and the range
        // `[offset, offset + size)` lies inside the mapping.
        let slice = unsafe {
            let base = self.addr.unwrap_unchecked().as_ptr();
            let ptr = base.add((offset - self.map_offset) as usize);
            slice::from_raw_parts_mut(ptr, size)
        };
        Ok(slice)
    }

    /// Grows the file to `length` bytes if it is currently shorter.
    fn ensure_capacity(&self, length: u64) -> Result<(), Error> {
        let current = self.file.metadata().map_err(Error::Stat)?.len();
        if current >= length {
            return Ok(());
        }
        self.file.set_len(length).map_err(Error::Truncate)
    }

    #[inline]
    fn unmap(&mut self, addr: NonNull<u8>) {
        // We just ignore the thrown error, there is nothing to do about it.
        _ = unsafe { libc::munmap(addr.as_ptr() as *mut libc::c_void, self.physical_size) };
        self.addr = None;
    }
}

impl Drop for MappedFile {
    #[inline]
    fn drop(&mut self) {
        if let Some(addr) = self.addr {
            self.unmap(addr);
        }
    }
}

// SAFETY: The mapping is exclusively owned through `&mut self` access.
unsafe impl Send for MappedFile {}

/// An append cursor over a [`MappedFile`].
pub struct Window {
    map: MappedFile,
    pos: u64,
}

impl Window {
    /// Wraps an open file with a write-only sliding window.
    ///
    /// The whole window is kept ahead of the cursor, which is the right
    /// placement for a stream that only moves forward.
    #[inline]
    pub fn new(file: File, map_size: usize) -> Result<Self, Error> {
        Ok(Self { map: MappedFile::new(file, map_size, map_size)?, pos: 0 })
    }

    /// Copies `buf` at the current position and advances past it.
    #[inline]
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.map.map(self.pos, buf.len())?.copy_from_slice(buf);
        self.pos += buf.len() as u64;
        Ok(())
    }

    /// Advances past `size` bytes without writing them, only ensuring the
    /// region is addressable.
    #[inline]
    pub fn reserve(&mut self, size: usize) -> Result<(), Error> {
        self.map.map(self.pos, size)?;
        self.pos += size as u64;
        Ok(())
    }

    /// The current position of the cursor.
    #[inline]
    pub fn tell(&self) -> u64 {
        self.pos
    }
}

/// Rounds up to a multiple of the operating system's memory page size.
#[inline]
fn round_up_page_size(value: usize) -> usize {
    let page_size = page_size();
    ((value - 1) / page_size + 1) * page_size
}

/// Obtains the operating system's memory page size.
fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    // It is not guaranteed that `sysconf` will be called only once in multiple threads,
    // but it is possible to reduce the number of times it is called.
    match PAGE_SIZE.load(Ordering::Acquire) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as usize;
            PAGE_SIZE.store(page_size, Ordering::Release);
            page_size
        }
        page_size => page_size,
    }
}
