//! The codepoint interner.
//!
//! Every record carries a 16-bit *codepoint* instead of a full source
//! location. The interner maps an object's identity to its codepoint and
//! writes the expanded descriptor into the codepoint list file exactly once,
//! on first sight; the descriptor's 0-based index in that file *is* the
//! codepoint.

use std::os::unix::ffi::OsStrExt;

use thiserror::Error;

use crate::{
    host::{CodeRef, HostValue, NativeRef, ObjectId, ValueKind},
    htable::{IntTable, TableFull},
    listfile::{self, ListFile},
    pack::{self, PackWriter},
};

/// Codepoint descriptor kinds, the first byte of every codepoint record.
pub const CODEPOINT_LOGLINE: u8 = 1;
pub const CODEPOINT_FUNCTION: u8 = 2;
pub const CODEPOINT_NATIVE: u8 = 3;

/// The interner holds at most this many codepoints; ids must fit in u16.
const CAPACITY: usize = u16::MAX as usize;

/// Scratch space for one serialized descriptor.
const SCRATCH_CAPACITY: usize = 16 * 1024;

/// Errors that can be occurred by interning a codepoint.
#[derive(Error, Debug)]
pub enum Error {
    /// The designated log line is not a byte string.
    #[error("log line is not a string")]
    LoglineNotString,
    #[error(transparent)]
    TableFull(#[from] TableFull),
    #[error("packing descriptor: {0}")]
    Pack(#[from] pack::Error),
    #[error("codepoint file: {0}")]
    List(#[from] listfile::Error),
}

/// Identity → codepoint mapping over the codepoint list file.
pub struct Interner {
    table: IntTable,
    codepoints: ListFile,
    scratch: PackWriter,
    canonical_paths: bool,
}

impl Interner {
    /// Wraps the codepoint list file.
    ///
    /// With `canonical_paths` set, function filenames are resolved to
    /// canonical absolute paths when the descriptor is saved.
    pub fn new(codepoints: ListFile, canonical_paths: bool) -> Self {
        Self {
            table: IntTable::with_capacity(CAPACITY),
            codepoints,
            scratch: PackWriter::new(SCRATCH_CAPACITY),
            canonical_paths,
        }
    }

    /// The codepoint of a pure function, saving its descriptor on first
    /// sight.
    pub fn function(&mut self, code: &CodeRef<'_>) -> Result<u16, Error> {
        if let Some(cp) = self.lookup(code.identity) {
            return Ok(cp);
        }
        self.scratch.clear();
        self.scratch.put_u8(CODEPOINT_FUNCTION)?;
        match self.canonical_filename(code.filename) {
            Some(resolved) => self.scratch.put_pstr(&resolved)?,
            None => self.scratch.put_pstr(code.filename)?,
        }
        self.scratch.put_pstr(code.name)?;
        self.scratch.put_u32(code.first_line)?;
        self.publish(code.identity)
    }

    /// The codepoint of a native function.
    pub fn native(&mut self, func: &NativeRef<'_>) -> Result<u16, Error> {
        if let Some(cp) = self.lookup(func.identity) {
            return Ok(cp);
        }
        self.scratch.clear();
        self.scratch.put_u8(CODEPOINT_NATIVE)?;
        self.scratch.put_pstr(func.module.unwrap_or(b""))?;
        self.scratch.put_pstr(func.name)?;
        self.publish(func.identity)
    }

    /// The codepoint of a log format string, which must be a byte string.
    pub fn logline(&mut self, fmt: &dyn HostValue) -> Result<u16, Error> {
        if let Some(cp) = self.lookup(fmt.identity()) {
            return Ok(cp);
        }
        if fmt.classify() != ValueKind::Bytes {
            return Err(Error::LoglineNotString);
        }
        let bytes = fmt.as_bytes().ok_or(Error::LoglineNotString)?;
        self.scratch.clear();
        self.scratch.put_u8(CODEPOINT_LOGLINE)?;
        self.scratch.put_pstr(bytes)?;
        self.publish(fmt.identity())
    }

    #[inline]
    fn lookup(&self, identity: ObjectId) -> Option<u16> {
        self.table.get(hash(identity), identity.0)
    }

    /// Appends the staged descriptor, then publishes the mapping. The
    /// on-disk record exists before the id is ever handed out, so a crash in
    /// between leaves at worst an orphaned descriptor.
    fn publish(&mut self, identity: ObjectId) -> Result<u16, Error> {
        let index = self.codepoints.append(self.scratch.bytes())?;
        self.table.set(hash(identity), identity.0, index as u16)?;
        Ok(index as u16)
    }

    fn canonical_filename(&self, filename: &[u8]) -> Option<Vec<u8>> {
        if !self.canonical_paths {
            return None;
        }
        let path = std::path::Path::new(std::ffi::OsStr::from_bytes(filename));
        let resolved = std::fs::canonicalize(path).ok()?;
        Some(resolved.as_os_str().as_bytes().to_vec())
    }
}

/// Object addresses are at least 8-aligned; the low bits carry no entropy.
#[inline]
fn hash(identity: ObjectId) -> u32 {
    (identity.0 >> 3) as u32
}
