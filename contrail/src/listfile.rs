//! Append-only list files.
//!
//! A [`ListFile`] is a single growing file of variable-size records, each
//! framed as `{size: u32, bytes}`. A record's 0-based append index
//! identifies it to downstream readers; the codepoint file uses the index as
//! the codepoint id, the time index simply appends in timestamp order.

use std::{fs::OpenOptions, io, path::Path};

use thiserror::Error;

use crate::mmap::{self, Window};

/// How much of a list file is kept mapped at a time.
const MAP_SIZE: usize = 1024 * 1024;

/// Errors that can be occurred by appending to a list file.
#[derive(Error, Debug)]
pub enum Error {
    /// Creating the file failed.
    #[error("open: {0}")]
    Open(io::Error),
    #[error("map: {0}")]
    Map(#[from] mmap::Error),
}

/// An append-only sequence of length-prefixed records.
pub struct ListFile {
    window: Window,
    next_index: u32,
}

impl ListFile {
    /// Creates (truncating) the list file at `path`.
    pub fn create(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(Error::Open)?;
        Ok(Self { window: Window::new(file, MAP_SIZE)?, next_index: 0 })
    }

    /// Appends one record and returns its 0-based index.
    pub fn append(&mut self, record: &[u8]) -> Result<u32, Error> {
        let index = self.next_index;
        self.window.write(&(record.len() as u32).to_le_bytes())?;
        self.window.write(record)?;
        self.next_index += 1;
        Ok(index)
    }

    /// The number of records appended so far.
    #[inline]
    pub fn len(&self) -> u32 {
        self.next_index
    }
}
