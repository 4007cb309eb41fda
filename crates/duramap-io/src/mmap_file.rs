//! A growable, memory-mapped data file.
//!
//! Wraps a single `File` + `MmapMut` pair: open-or-create, grow (or
//! shrink) to a page-rounded size via `ftruncate` + re-`mmap`, and
//! `msync` with either blocking or asynchronous semantics. Growth
//! zero-fills the newly added bytes explicitly, rather than relying on
//! the platform's sparse-extension guarantee, so CRC32 recomputation
//! over the grown region is deterministic on every target.
//!
//! The caller (the storage engine) decides *when* and *to what size* to
//! grow — typically doubling until a pending write fits — this type
//! only guarantees the invariant that whatever size it is asked to hold
//! is rounded up to a whole number of OS pages.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::IoError;

/// Directive for [`MmapFile::msync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFlag {
    /// Block until the OS confirms the pages are on stable storage.
    Sync,
    /// Schedule the flush and return immediately.
    Async,
}

fn os_page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` is always safe to call; it
    // reads a read-only kernel-reported constant and never fails on any
    // platform providing `_SC_PAGESIZE`.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        4096
    } else {
        page_size as usize
    }
}

/// Rounds `size` up to the next multiple of `page_size` (at least one
/// page).
pub fn round_up_to_page(size: usize, page_size: usize) -> usize {
    if size == 0 {
        return page_size;
    }
    size.div_ceil(page_size) * page_size
}

pub struct MmapFile {
    path: PathBuf,
    file: File,
    mmap: Option<MmapMut>,
    size: usize,
    page_size: usize,
}

impl MmapFile {
    /// Opens `path`, creating it if absent, and maps it at (at least)
    /// one page, rounding any pre-existing length up to a page
    /// multiple.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let page_size = os_page_size();
        let current_len = file.metadata()?.len() as usize;

        let mut this = MmapFile {
            path,
            file,
            mmap: None,
            size: 0,
            page_size,
        };
        let target = round_up_to_page(current_len, page_size);
        this.truncate(target)?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current mapped size in bytes; always a multiple of the page
    /// size.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Read-only view of the mapped region.
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Mutable view of the mapped region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mmap.as_deref_mut().unwrap_or(&mut [])
    }

    /// Grows or shrinks the backing file to `new_size` rounded up to a
    /// page multiple, zero-filling any newly added bytes. On any I/O
    /// failure the file length and mapping are left exactly as they
    /// were before the call.
    pub fn truncate(&mut self, new_size: usize) -> Result<(), IoError> {
        let rounded = round_up_to_page(new_size, self.page_size);
        if rounded == self.size && self.mmap.is_some() {
            return Ok(());
        }
        let old_size = self.size;

        if let Err(e) = self.file.set_len(rounded as u64) {
            return Err(e.into());
        }

        self.mmap = None;
        // SAFETY: `self.file` stays open for at least as long as the
        // mapping, and only this process-local handle touches it here;
        // concurrent cross-process mutation is coordinated by the file
        // lock above this layer, not by the mapping itself.
        let map_result = unsafe { MmapMut::map_mut(&self.file) };
        let mut mmap = match map_result {
            Ok(m) => m,
            Err(e) => {
                // Roll back the length change; best-effort.
                let _ = self.file.set_len(old_size as u64);
                return Err(e.into());
            }
        };

        if rounded > old_size {
            mmap[old_size..rounded].fill(0);
        }

        self.mmap = Some(mmap);
        self.size = rounded;
        Ok(())
    }

    /// Flushes the mapped region to stable storage.
    pub fn msync(&self, flag: SyncFlag) -> Result<(), IoError> {
        let Some(mmap) = self.mmap.as_ref() else {
            return Ok(());
        };
        match flag {
            SyncFlag::Sync => mmap.flush()?,
            SyncFlag::Async => mmap.flush_async()?,
        }
        Ok(())
    }

    /// Drops and re-establishes the mapping over the current file
    /// length, without changing the file's size. Used after another
    /// process has grown the file and this process needs to observe the
    /// new tail.
    pub fn remap(&mut self) -> Result<(), IoError> {
        let len = self.file.metadata()?.len() as usize;
        self.mmap = None;
        // SAFETY: see `truncate`.
        let mmap = unsafe { MmapMut::map_mut(&self.file) }?;
        self.size = len;
        self.mmap = Some(mmap);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_or_create_rounds_to_one_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let f = MmapFile::open_or_create(&path).unwrap();
        assert_eq!(f.size(), f.page_size());
        assert_eq!(f.size() % f.page_size(), 0);
    }

    #[test]
    fn truncate_grows_and_zero_fills() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut f = MmapFile::open_or_create(&path).unwrap();
        let page = f.page_size();

        f.as_mut_slice()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        f.truncate(page * 3 + 1).unwrap();
        assert_eq!(f.size(), page * 4);
        assert_eq!(&f.as_slice()[0..4], &[1, 2, 3, 4]);
        assert!(f.as_slice()[page..page * 4].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_to_same_size_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut f = MmapFile::open_or_create(&path).unwrap();
        let size_before = f.size();
        f.truncate(size_before).unwrap();
        assert_eq!(f.size(), size_before);
    }

    #[test]
    fn remap_observes_growth_from_another_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut writer = MmapFile::open_or_create(&path).unwrap();
        let page = writer.page_size();
        writer.truncate(page * 2).unwrap();

        let mut reader = MmapFile::open_or_create(&path).unwrap();
        reader.remap().unwrap();
        assert_eq!(reader.size(), page * 2);
    }
}
