//! # Backing File
//!
//! `DiskFile` wraps the single file (or block device) behind the buffer pool.
//! The file is sized to exactly `pages * PAGE_SIZE` bytes at open and never
//! grows; page identity is positional, so there is no allocation metadata on
//! disk at all.
//!
//! ## Concurrency
//!
//! All reads and writes are positional (`pread`/`pwrite` on unix,
//! `seek_read`/`seek_write` on windows) against a shared handle, so the page
//! provider, the checkpointer, and any worker thread faulting a page in can
//! issue I/O concurrently without seek coordination or a file mutex.
//!
//! ## Direct I/O
//!
//! When opened with `direct: true` (unix only), `O_DIRECT` bypasses the OS
//! page cache so the buffer pool is the only cache in the system. Every page
//! buffer handed to this module is 4096-aligned (`Page` carries the
//! alignment), which satisfies the kernel's alignment contract. The switch
//! defaults to off: common test filesystems such as tmpfs reject `O_DIRECT`.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use zerocopy::IntoBytes;

use super::{Page, PAGE_SIZE};

/// The backing store: a fixed-size file addressed by page id.
#[derive(Debug)]
pub struct DiskFile {
    file: File,
    pages: u64,
}

impl DiskFile {
    /// Opens (creating if necessary) and sizes the backing file.
    ///
    /// With `truncate`, existing content is discarded. The file is always
    /// extended or shrunk to exactly `pages * PAGE_SIZE` bytes.
    pub fn open(path: &Path, pages: u64, truncate: bool, direct: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        if truncate {
            options.truncate(true);
        }

        #[cfg(unix)]
        if direct {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(unix))]
        let _ = direct;

        let file = options
            .open(path)
            .wrap_err_with(|| format!("cannot open backing store {}", path.display()))?;

        file.set_len(pages * PAGE_SIZE as u64)
            .wrap_err_with(|| format!("cannot size backing store {}", path.display()))?;

        Ok(Self { file, pages })
    }

    pub fn page_count(&self) -> u64 {
        self.pages
    }

    /// Synchronous positional read of page `pid` into `page`.
    pub fn read_page(&self, pid: u64, page: &mut Page) -> Result<()> {
        ensure!(pid < self.pages, "page id {} out of bounds ({})", pid, self.pages);
        let offset = pid * PAGE_SIZE as u64;

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file
                .read_exact_at(page.as_mut_bytes(), offset)
                .wrap_err_with(|| format!("read of page {} failed", pid))?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut done = 0;
            let bytes = page.as_mut_bytes();
            while done < PAGE_SIZE {
                let n = self
                    .file
                    .seek_read(&mut bytes[done..], offset + done as u64)
                    .wrap_err_with(|| format!("read of page {} failed", pid))?;
                ensure!(n > 0, "read of page {} truncated", pid);
                done += n;
            }
        }

        Ok(())
    }

    /// Synchronous positional write of `page` to slot `pid`.
    pub fn write_page(&self, pid: u64, page: &Page) -> Result<()> {
        ensure!(pid < self.pages, "page id {} out of bounds ({})", pid, self.pages);
        let offset = pid * PAGE_SIZE as u64;

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file
                .write_all_at(page.as_bytes(), offset)
                .wrap_err_with(|| format!("write of page {} failed", pid))?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut done = 0;
            let bytes = page.as_bytes();
            while done < PAGE_SIZE {
                let n = self
                    .file
                    .seek_write(&bytes[done..], offset + done as u64)
                    .wrap_err_with(|| format!("write of page {} failed", pid))?;
                ensure!(n > 0, "write of page {} truncated", pid);
                done += n;
            }
        }

        Ok(())
    }

    /// Flushes file data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data().wrap_err("sync of backing store failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_file(pages: u64) -> (tempfile::TempDir, DiskFile) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let disk = DiskFile::open(&path, pages, true, false).unwrap();
        (dir, disk)
    }

    #[test]
    fn open_sizes_file_to_page_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let _disk = DiskFile::open(&path, 8, true, false).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 8 * PAGE_SIZE as u64);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, disk) = open_test_file(4);

        let mut page = Page::zeroed();
        page.set_lsn(99);
        page.set_dt_id(3);
        page.payload_mut()[0] = 0xEE;
        disk.write_page(2, &page).unwrap();

        let mut back = Page::zeroed();
        disk.read_page(2, &mut back).unwrap();
        assert_eq!(back.lsn(), 99);
        assert_eq!(back.dt_id(), 3);
        assert_eq!(back.payload()[0], 0xEE);
    }

    #[test]
    fn page_identity_is_positional() {
        let (_dir, disk) = open_test_file(4);

        for pid in 0..4u64 {
            let mut page = Page::zeroed();
            page.set_lsn(pid + 1);
            disk.write_page(pid, &page).unwrap();
        }

        let mut back = Page::zeroed();
        for pid in 0..4u64 {
            disk.read_page(pid, &mut back).unwrap();
            assert_eq!(back.lsn(), pid + 1, "page {} holds wrong content", pid);
        }
    }

    #[test]
    fn out_of_bounds_pid_is_rejected() {
        let (_dir, disk) = open_test_file(4);

        let mut page = Page::zeroed();
        assert!(disk.read_page(4, &mut page).is_err());
        assert!(disk.write_page(100, &page).is_err());
    }

    #[test]
    fn truncate_discards_previous_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let disk = DiskFile::open(&path, 2, true, false).unwrap();
            let mut page = Page::zeroed();
            page.set_lsn(7);
            disk.write_page(0, &page).unwrap();
        }

        let disk = DiskFile::open(&path, 2, true, false).unwrap();
        let mut back = Page::zeroed();
        disk.read_page(0, &mut back).unwrap();
        assert_eq!(back.lsn(), 0);
    }

    #[test]
    fn reopen_without_truncate_preserves_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let disk = DiskFile::open(&path, 2, true, false).unwrap();
            let mut page = Page::zeroed();
            page.set_lsn(7);
            disk.write_page(1, &page).unwrap();
            disk.sync().unwrap();
        }

        let disk = DiskFile::open(&path, 2, false, false).unwrap();
        let mut back = Page::zeroed();
        disk.read_page(1, &mut back).unwrap();
        assert_eq!(back.lsn(), 7);
    }
}
