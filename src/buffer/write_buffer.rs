//! # Write Buffer
//!
//! Fixed-capacity batching writer for dirty pages. Each background task owns
//! one; the buffer is not shared across threads.
//!
//! ## Copy-Out Contract
//!
//! `add` takes a *copy* of the page bytes together with the frame identity
//! and the page LSN at copy time. The original page can keep being mutated
//! by concurrent writers the moment the copy is taken; the write that
//! eventually lands on storage is the copied version, and the completion
//! callback reports the copied LSN so the frame's `last_written_lsn` reflects
//! exactly what is durable.
//!
//! Before calling `add`, the caller must have marked the frame `is_wb` under
//! the protection appropriate to its path (the global cooling mutex for
//! Phase B's Cold frames, an exclusive latch for the checkpointer's Hot
//! ones). The `is_wb` flag keeps the frame alive until the completion
//! callback has run.
//!
//! ## Completion
//!
//! `submit_if_necessary` issues one positional write per queued entry once
//! the queue reaches the batch size, then invokes `on_complete(frame,
//! copied_lsn)` per successful write. The callback must terminate once it
//! wins the frame latch (it sets `last_written_lsn` and clears `is_wb`).
//! A failed write is fatal for that frame: its callback is never invoked,
//! `is_wb` stays set, and the frame is effectively quarantined.

use eyre::Result;
use tracing::error;

use crate::storage::{DiskFile, Page};

struct PendingWrite {
    frame: usize,
    pid: u64,
    lsn: u64,
    page: Box<Page>,
}

/// Batched asynchronous-writeback staging area.
pub struct WriteBuffer {
    capacity: usize,
    pending: Vec<PendingWrite>,
    spare: Vec<Box<Page>>,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Vec::with_capacity(capacity),
            spare: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    /// Queues a copy of `src` for writeback on behalf of `frame`.
    ///
    /// `fill` receives the staging page and performs the copy (plus any
    /// serialization fixups the owning data structure needs). `lsn` must be
    /// the page LSN at copy time.
    pub fn add<F>(&mut self, frame: usize, pid: u64, lsn: u64, fill: F)
    where
        F: FnOnce(&mut Page),
    {
        debug_assert!(!self.is_full(), "write buffer overfilled");
        let mut page = self
            .spare
            .pop()
            .unwrap_or_else(|| Box::new(Page::zeroed()));
        fill(&mut page);
        self.pending.push(PendingWrite {
            frame,
            pid,
            lsn,
            page,
        });
    }

    /// Issues the queued writes if the queue has reached `batch_size`.
    ///
    /// Returns the number of pages written.
    pub fn submit_if_necessary<F>(
        &mut self,
        disk: &DiskFile,
        batch_size: usize,
        on_complete: F,
    ) -> Result<usize>
    where
        F: FnMut(usize, u64),
    {
        if self.pending.len() < batch_size {
            return Ok(0);
        }
        self.submit(disk, on_complete)
    }

    /// Issues every queued write regardless of batch size. Used at shutdown
    /// so no frame is left with `is_wb` set and its copy unwritten.
    pub fn flush<F>(&mut self, disk: &DiskFile, on_complete: F) -> Result<usize>
    where
        F: FnMut(usize, u64),
    {
        self.submit(disk, on_complete)
    }

    fn submit<F>(&mut self, disk: &DiskFile, mut on_complete: F) -> Result<usize>
    where
        F: FnMut(usize, u64),
    {
        let mut written = 0;
        let mut first_error = None;

        for entry in self.pending.drain(..) {
            match disk.write_page(entry.pid, &entry.page) {
                Ok(()) => {
                    on_complete(entry.frame, entry.lsn);
                    written += 1;
                }
                Err(err) => {
                    // The frame keeps is_wb set and is quarantined.
                    error!(pid = entry.pid, frame = entry.frame, %err, "page writeback failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
            self.spare.push(entry.page);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_disk(pages: u64) -> (tempfile::TempDir, DiskFile) {
        let dir = tempdir().unwrap();
        let disk = DiskFile::open(&dir.path().join("wb.db"), pages, true, false).unwrap();
        (dir, disk)
    }

    fn stamped_page(lsn: u64) -> Page {
        let mut page = Page::zeroed();
        page.set_lsn(lsn);
        page
    }

    #[test]
    fn add_copies_page_bytes() {
        let mut wb = WriteBuffer::new(4);
        let mut src = stamped_page(5);

        wb.add(0, 1, src.lsn(), |dst| dst.copy_from(&src));
        // Mutating the source after add must not affect the queued copy.
        src.set_lsn(99);

        let (_dir, disk) = test_disk(4);
        let mut completions = Vec::new();
        let written = wb.flush(&disk, |frame, lsn| completions.push((frame, lsn))).unwrap();

        assert_eq!(written, 1);
        assert_eq!(completions, vec![(0, 5)]);

        let mut back = Page::zeroed();
        disk.read_page(1, &mut back).unwrap();
        assert_eq!(back.lsn(), 5);
    }

    #[test]
    fn submit_waits_for_batch_size() {
        let (_dir, disk) = test_disk(8);
        let mut wb = WriteBuffer::new(8);

        let page = stamped_page(1);
        wb.add(0, 0, 1, |dst| dst.copy_from(&page));

        let written = wb.submit_if_necessary(&disk, 3, |_, _| {}).unwrap();
        assert_eq!(written, 0);
        assert_eq!(wb.len(), 1);

        wb.add(1, 1, 1, |dst| dst.copy_from(&page));
        wb.add(2, 2, 1, |dst| dst.copy_from(&page));

        let written = wb.submit_if_necessary(&disk, 3, |_, _| {}).unwrap();
        assert_eq!(written, 3);
        assert!(wb.is_empty());
    }

    #[test]
    fn completion_reports_copied_lsn_per_frame() {
        let (_dir, disk) = test_disk(8);
        let mut wb = WriteBuffer::new(8);

        for i in 0..3u64 {
            let page = stamped_page(10 + i);
            wb.add(i as usize, i, 10 + i, |dst| dst.copy_from(&page));
        }

        let mut completions = Vec::new();
        wb.flush(&disk, |frame, lsn| completions.push((frame, lsn))).unwrap();

        assert_eq!(completions, vec![(0, 10), (1, 11), (2, 12)]);
    }

    #[test]
    fn failed_write_skips_callback_and_reports() {
        let (_dir, disk) = test_disk(2);
        let mut wb = WriteBuffer::new(4);

        let page = stamped_page(1);
        // Out-of-bounds pid forces a write failure for the first entry.
        wb.add(0, 50, 1, |dst| dst.copy_from(&page));
        wb.add(1, 1, 1, |dst| dst.copy_from(&page));

        let mut completions = Vec::new();
        let result = wb.flush(&disk, |frame, lsn| completions.push((frame, lsn)));

        assert!(result.is_err());
        assert_eq!(completions, vec![(1, 1)]);
        assert!(wb.is_empty());
    }

    #[test]
    fn capacity_is_tracked() {
        let mut wb = WriteBuffer::new(2);
        assert!(!wb.is_full());

        let page = stamped_page(1);
        wb.add(0, 0, 1, |dst| dst.copy_from(&page));
        wb.add(1, 1, 1, |dst| dst.copy_from(&page));

        assert!(wb.is_full());
    }
}
