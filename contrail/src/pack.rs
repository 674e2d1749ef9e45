//! The record scratch buffer.
//!
//! Records are staged into a [`PackWriter`] and handed to the rotating log as
//! a single blob, so a record is either written whole into one file or not at
//! all; the log never sees a partially built record.

use thiserror::Error;

/// Errors that can be occurred by packing bytes into the scratch buffer.
#[derive(Error, Clone, Debug)]
pub enum Error {
    /// The scratch buffer is exhausted.
    #[error("scratch buffer exhausted")]
    Overflow,
}

/// The largest string a length-prefixed field can carry; longer inputs are
/// truncated to this many bytes.
pub const MAX_PSTR_LEN: usize = u16::MAX as usize;

/// A fixed-capacity byte buffer with little-endian packing primitives.
pub struct PackWriter {
    buf: Vec<u8>,
    capacity: usize,
}

impl PackWriter {
    /// Constructs a writer that holds at most `capacity` bytes.
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity), capacity }
    }

    /// Resets the cursor to the beginning of the buffer.
    #[inline]
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// The number of bytes packed so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// The packed blob.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Appends raw bytes.
    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.buf.len() + bytes.len() > self.capacity {
            return Err(Error::Overflow);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        self.put_bytes(&[value])
    }

    #[inline]
    pub fn put_u16(&mut self, value: u16) -> Result<(), Error> {
        self.put_bytes(&value.to_le_bytes())
    }

    #[inline]
    pub fn put_u32(&mut self, value: u32) -> Result<(), Error> {
        self.put_bytes(&value.to_le_bytes())
    }

    #[inline]
    pub fn put_u64(&mut self, value: u64) -> Result<(), Error> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Appends a length-prefixed string: a `u16` length followed by that many
    /// bytes. Inputs longer than [`MAX_PSTR_LEN`] are truncated.
    pub fn put_pstr(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let len = bytes.len().min(MAX_PSTR_LEN);
        let mark = self.buf.len();
        self.put_u16(len as u16)?;
        if let Err(err) = self.put_bytes(&bytes[..len]) {
            // Un-write the length prefix, the field is all or nothing.
            self.buf.truncate(mark);
            return Err(err);
        }
        Ok(())
    }
}
