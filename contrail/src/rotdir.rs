//! Rotating directories.
//!
//! A [`RotDir`] bounds the disk footprint of a trace: it hands out at most
//! `max_files` file slots and, when every slot has been used, reclaims the
//! one whose file was *released* longest ago by unlinking it. The directory
//! therefore always retains the most recently released files, which for a
//! rotating record stream means the most recent history.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use thiserror::Error;

/// Longest rotating-file name, in bytes.
pub const MAX_FILENAME_LEN: usize = 100;

/// Longest file prefix, in bytes. The remainder of the name budget is taken
/// by the counter and extension.
pub const MAX_PREFIX_LEN: usize = MAX_FILENAME_LEN - 20;

/// Errors that can be occurred by allocating rotating files.
#[derive(Error, Debug)]
pub enum Error {
    /// The directory path exceeds the platform limit.
    #[error("directory path too long")]
    PathTooLong,
    /// The file prefix exceeds [`MAX_PREFIX_LEN`].
    #[error("file prefix too long")]
    PrefixTooLong,
    /// Every slot is allocated and none can be reclaimed.
    #[error("out of file slots")]
    OutOfSlots,
    /// Removing the reclaimed slot's old file failed.
    #[error("unlink: {0}")]
    Unlink(io::Error),
    /// The slot id does not name a slot of this directory.
    #[error("invalid slot")]
    InvalidSlot,
    /// The directory could not be created.
    #[error("create dir: {0}")]
    CreateDir(io::Error),
}

#[derive(Default)]
struct Slot {
    allocated: bool,
    dealloc_order: u32,
    /// Empty until the slot is first used; retained after deallocation so
    /// the file survives until the slot is reclaimed.
    filename: String,
}

struct Slots {
    files: Vec<Slot>,
    alloc_counter: u32,
    dealloc_counter: u32,
}

/// A bounded directory of rotating files, shared by tracers with distinct
/// prefixes. Allocation and deallocation are mutex-guarded.
pub struct RotDir {
    path: PathBuf,
    inner: Mutex<Slots>,
}

impl RotDir {
    /// Opens (creating if missing) a rotating directory with `max_files`
    /// slots.
    pub fn new(path: impl Into<PathBuf>, max_files: usize) -> Result<Self, Error> {
        let path = path.into();
        if path.as_os_str().len() > libc::PATH_MAX as usize - (MAX_FILENAME_LEN + 2) {
            return Err(Error::PathTooLong);
        }
        fs::create_dir_all(&path).map_err(Error::CreateDir)?;

        let mut files = Vec::with_capacity(max_files);
        files.resize_with(max_files, Slot::default);
        Ok(Self {
            path,
            inner: Mutex::new(Slots { files, alloc_counter: 0, dealloc_counter: 0 }),
        })
    }

    /// The directory path.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocates a file slot and synthesizes the next file name for
    /// `prefix`.
    ///
    /// A never-used slot is preferred; otherwise the deallocated slot with
    /// the oldest release order is reclaimed and its file unlinked. The
    /// returned path does not exist yet, creating the file is the caller's
    /// business.
    pub fn allocate(&self, prefix: &str) -> Result<(usize, PathBuf), Error> {
        if prefix.len() > MAX_PREFIX_LEN {
            return Err(Error::PrefixTooLong);
        }

        let mut inner = self.inner.lock().unwrap();
        let slot = self.free_slot(&mut inner)?;

        let filename = format!("{}.{:06}.rot", prefix, inner.alloc_counter);
        inner.alloc_counter += 1;
        let path = self.path.join(&filename);

        let file = &mut inner.files[slot];
        file.allocated = true;
        file.filename = filename;

        Ok((slot, path))
    }

    /// Releases a slot, stamping it with the current release order. The file
    /// itself stays on disk until the slot is reclaimed.
    pub fn deallocate(&self, slot: usize) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner.dealloc_counter;
        let file = inner.files.get_mut(slot).ok_or(Error::InvalidSlot)?;
        file.allocated = false;
        file.dealloc_order = order;
        inner.dealloc_counter += 1;
        Ok(())
    }

    /// Finds a free slot, unlinking the reclaimed file if there is one.
    fn free_slot(&self, inner: &mut Slots) -> Result<usize, Error> {
        let mut oldest: Option<(u32, usize)> = None;

        for (i, file) in inner.files.iter().enumerate() {
            if file.allocated {
                continue;
            }
            if file.filename.is_empty() {
                // An empty slot, no need to rotate.
                return Ok(i);
            }
            if oldest.map_or(true, |(order, _)| order > file.dealloc_order) {
                oldest = Some((file.dealloc_order, i));
            }
        }

        let (_, index) = oldest.ok_or(Error::OutOfSlots)?;
        fs::remove_file(self.path.join(&inner.files[index].filename)).map_err(Error::Unlink)?;
        inner.files[index].filename.clear();
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use crate::rotdir::{Error, RotDir, MAX_PREFIX_LEN};

    fn touch(path: &std::path::Path) {
        fs::File::create(path).unwrap();
    }

    fn names(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_lru_by_release_reclamation() {
        let dir = tempdir().unwrap();
        let rotdir = RotDir::new(dir.path(), 3).unwrap();

        let (slot_a, a) = rotdir.allocate("t").unwrap();
        let (slot_b, b) = rotdir.allocate("t").unwrap();
        let (slot_c, c) = rotdir.allocate("t").unwrap();
        assert_eq!(a.file_name().unwrap(), "t.000000.rot");
        assert_eq!(b.file_name().unwrap(), "t.000001.rot");
        assert_eq!(c.file_name().unwrap(), "t.000002.rot");
        for path in [&a, &b, &c] {
            touch(path);
        }

        rotdir.deallocate(slot_a).unwrap();
        rotdir.deallocate(slot_b).unwrap();
        rotdir.deallocate(slot_c).unwrap();

        // The oldest released slot is reclaimed first and its file removed.
        let (slot_d, d) = rotdir.allocate("t").unwrap();
        assert_eq!(slot_d, slot_a);
        assert_eq!(d.file_name().unwrap(), "t.000003.rot");
        touch(&d);

        assert_eq!(names(dir.path()), ["t.000001.rot", "t.000002.rot", "t.000003.rot"]);
    }

    #[test]
    fn test_out_of_slots() {
        let dir = tempdir().unwrap();
        let rotdir = RotDir::new(dir.path(), 2).unwrap();
        rotdir.allocate("t").unwrap();
        rotdir.allocate("t").unwrap();
        assert!(matches!(rotdir.allocate("t"), Err(Error::OutOfSlots)));
    }

    #[test]
    fn test_counter_shared_across_prefixes() {
        let dir = tempdir().unwrap();
        let rotdir = RotDir::new(dir.path(), 4).unwrap();
        let (_, a) = rotdir.allocate("one").unwrap();
        let (_, b) = rotdir.allocate("two").unwrap();
        assert_eq!(a.file_name().unwrap(), "one.000000.rot");
        assert_eq!(b.file_name().unwrap(), "two.000001.rot");
    }

    #[test]
    fn test_prefix_too_long() {
        let dir = tempdir().unwrap();
        let rotdir = RotDir::new(dir.path(), 1).unwrap();
        let prefix = "p".repeat(MAX_PREFIX_LEN + 1);
        assert!(matches!(rotdir.allocate(&prefix), Err(Error::PrefixTooLong)));
    }

    #[test]
    fn test_invalid_slot() {
        let dir = tempdir().unwrap();
        let rotdir = RotDir::new(dir.path(), 1).unwrap();
        assert!(matches!(rotdir.deallocate(5), Err(Error::InvalidSlot)));
    }
}
