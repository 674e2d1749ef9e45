//! Records striped across rotating files.
//!
//! A [`RotRec`] writes a conceptually infinite stream of records through a
//! bounded set of fixed-size files. Each file starts with the stream offset
//! at which it begins, so a record's absolute position survives rotation and
//! reclamation of earlier files.
//!
//! # The file layout
//!
//! ```plain
//!    ┌───────────────┬──────────────────────────────────────────┐
//!    │  base offset  │  records ...                             │
//!    ▲───────────────▲──────┬───────────────────────────────────┘
//!    └────── 8 ──────┘      │   ┌──────────┬───────────────┐
//!                           └──▶│   size   │     bytes     │
//!                               ▲──────────▲───────────────▲
//!                               └──── 2 ───┴──── size ─────┘
//! ```
//!
//! `total_file_size = file_data_size + 8`; a file's `base_offset` equals the
//! sum of `total_file_size` over every earlier file of the stream.

use std::{fs::OpenOptions, io, sync::Arc};

use thiserror::Error;

use crate::{
    mmap::{self, Window},
    rotdir::{self, RotDir},
};

/// Size of the per-file `base_offset` header.
pub const FILE_HEADER_SIZE: u64 = 8;

/// Errors that can be occurred by writing rotated records.
#[derive(Error, Debug)]
pub enum Error {
    /// The map window must fit inside a single file's data area.
    #[error("map size greater than file size")]
    MapSizeGreaterThanFileSize,
    /// The record exceeds a file's data area and can never be written.
    #[error("record larger than file data size")]
    SizeTooLarge,
    /// Creating the next rotating file failed.
    #[error("open: {0}")]
    Open(io::Error),
    #[error("rotating directory: {0}")]
    Dir(#[from] rotdir::Error),
    #[error("map: {0}")]
    Map(#[from] mmap::Error),
}

struct OpenFile {
    slot: usize,
    window: Window,
}

/// A rotating record writer over a shared [`RotDir`].
pub struct RotRec {
    rotdir: Arc<RotDir>,
    prefix: String,
    map_size: usize,
    file_data_size: u64,
    total_file_size: u64,
    base_offset: u64,
    /// Set when a file is closed: the next file's header must account for
    /// the closed one.
    advance_base: bool,
    open: Option<OpenFile>,
}

impl RotRec {
    /// Constructs a writer that rotates `prefix`-named files of
    /// `file_data_size` data bytes each, mapped `map_size` bytes at a time.
    pub fn new(
        rotdir: Arc<RotDir>,
        prefix: &str,
        map_size: usize,
        file_data_size: u64,
    ) -> Result<Self, Error> {
        if map_size as u64 > file_data_size {
            return Err(Error::MapSizeGreaterThanFileSize);
        }
        Ok(Self {
            rotdir,
            prefix: prefix.to_string(),
            map_size,
            file_data_size,
            total_file_size: file_data_size + FILE_HEADER_SIZE,
            base_offset: 0,
            advance_base: false,
            open: None,
        })
    }

    /// Writes one record, rotating to a new file if it would not fit in the
    /// current one, and returns the record's absolute stream offset.
    ///
    /// Records never span files.
    pub fn write(&mut self, record: &[u8]) -> Result<u64, Error> {
        if record.len() as u64 > self.file_data_size {
            return Err(Error::SizeTooLarge);
        }

        let framed = (2 + record.len()) as u64;
        if let Some(open) = &self.open {
            // Rotate when the record would push past the end, unless the
            // file holds nothing but its header yet (a maximum-size record
            // must land somewhere).
            if open.window.tell() + framed > self.total_file_size
                && open.window.tell() > FILE_HEADER_SIZE
            {
                self.close_file()?;
            }
        }
        if self.open.is_none() {
            self.open_file()?;
        }

        // SAFETY: a `None` variant for `open` would have been replaced by a
        // `Some` variant in the code above.
        let open = unsafe { self.open.as_mut().unwrap_unchecked() };
        let offset = self.base_offset + open.window.tell();
        open.window.write(&(record.len() as u16).to_le_bytes())?;
        open.window.write(record)?;
        Ok(offset)
    }

    /// Closes the current file, releasing its slot. Further writes open a
    /// fresh file. Idempotent.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.open.is_some() {
            self.close_file()?;
        }
        Ok(())
    }

    fn open_file(&mut self) -> Result<(), Error> {
        let (slot, path) = self.rotdir.allocate(&self.prefix)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                _ = self.rotdir.deallocate(slot);
                Error::Open(err)
            })?;

        let mut window = match Window::new(file, self.map_size) {
            Ok(window) => window,
            Err(err) => {
                _ = self.rotdir.deallocate(slot);
                return Err(err.into());
            }
        };

        let mut base_offset = self.base_offset;
        if self.advance_base {
            base_offset += self.total_file_size;
        }

        if let Err(err) = window.write(&base_offset.to_le_bytes()) {
            _ = self.rotdir.deallocate(slot);
            return Err(err.into());
        }

        self.advance_base = false;
        self.base_offset = base_offset;
        self.open = Some(OpenFile { slot, window });
        Ok(())
    }

    fn close_file(&mut self) -> Result<(), Error> {
        if let Some(open) = self.open.take() {
            self.rotdir.deallocate(open.slot)?;
            self.advance_base = true;
        }
        Ok(())
    }
}

impl Drop for RotRec {
    #[inline]
    fn drop(&mut self) {
        // We just ignore the thrown error inside the `Drop` method.
        _ = self.close();
    }
}
