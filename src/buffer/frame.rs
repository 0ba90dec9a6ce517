//! # Buffer Frames
//!
//! A buffer frame is one DRAM slot of the pool: a versioned latch, residency
//! metadata, and the page bytes themselves, colocated in one struct so a
//! frame is addressable by a single reference. Frames are allocated once at
//! engine start into a contiguous arena and never freed until shutdown;
//! everything that "points at a frame" does so by arena index.
//!
//! ## Residency States
//!
//! ```text
//! Free ──allocate/load──► Hot ──unswizzle──► Cold ──reclaim──► Free
//!                          ▲                   │
//!                          └────re-resolve─────┘
//! ```
//!
//! - **Free**: on the reservoir's free list, contents meaningless.
//! - **Hot**: reachable from a data structure through a swizzled swip.
//! - **Cold**: sitting in the cooling FIFO awaiting writeback/reclaim; still
//!   holds valid page bytes and can be promoted straight back to Hot.
//!
//! ## Field Protection
//!
//! Header fields are individual atomics: `state` is flipped under the global
//! cooling mutex, `is_wb` and `last_written_lsn` under the frame latch by the
//! writeback completion path, and `pid` only while the frame is unreachable
//! (freshly popped from the free list, latched exclusively). The page body is
//! protected by the versioned latch alone: writers hold it exclusively,
//! optimistic readers validate with `recheck` after reading.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::storage::Page;
use crate::sync::VersionLock;

/// Sentinel for a frame that holds no page.
pub const INVALID_PID: u64 = u64::MAX;

/// Residency state of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    Free = 0,
    Hot = 1,
    Cold = 2,
}

impl FrameState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FrameState::Hot,
            2 => FrameState::Cold,
            _ => FrameState::Free,
        }
    }
}

/// One slot of the DRAM pool: latch + residency header + page bytes.
pub struct BufferFrame {
    latch: VersionLock,
    pid: AtomicU64,
    state: AtomicU8,
    is_wb: AtomicBool,
    last_written_lsn: AtomicU64,
    page: UnsafeCell<Page>,
}

// SAFETY: all header fields are atomics; the page body is guarded by the
// versioned latch protocol (exclusive writers, recheck-validated readers).
unsafe impl Send for BufferFrame {}
unsafe impl Sync for BufferFrame {}

impl BufferFrame {
    pub fn new() -> Self {
        Self {
            latch: VersionLock::new(),
            pid: AtomicU64::new(INVALID_PID),
            state: AtomicU8::new(FrameState::Free as u8),
            is_wb: AtomicBool::new(false),
            last_written_lsn: AtomicU64::new(0),
            page: UnsafeCell::new(Page::zeroed()),
        }
    }

    pub fn latch(&self) -> &VersionLock {
        &self.latch
    }

    pub fn pid(&self) -> u64 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: u64) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: FrameState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_wb(&self) -> bool {
        self.is_wb.load(Ordering::Acquire)
    }

    pub fn set_wb(&self, in_flight: bool) {
        self.is_wb.store(in_flight, Ordering::Release);
    }

    pub fn last_written_lsn(&self) -> u64 {
        self.last_written_lsn.load(Ordering::Acquire)
    }

    pub fn set_last_written_lsn(&self, lsn: u64) {
        self.last_written_lsn.store(lsn, Ordering::Release);
    }

    /// A frame is dirty iff its page has been stamped past the last write.
    pub fn is_dirty(&self) -> bool {
        self.page().lsn() > self.last_written_lsn()
    }

    /// Shared view of the page bytes.
    ///
    /// The returned reference is only trustworthy under the latch protocol:
    /// either the caller holds the latch exclusively, or it re-validates its
    /// optimistic guard after every read and discards the values on restart.
    pub fn page(&self) -> &Page {
        // SAFETY: the pointer is always valid (arena-owned, never freed).
        // Torn reads under concurrent mutation are possible by design and are
        // neutralized by the recheck discipline described above.
        unsafe { &*self.page.get() }
    }

    /// Mutable view of the page bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold this frame's latch exclusively, or otherwise have
    /// sole access (frame freshly popped from the free list).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_mut(&self) -> &mut Page {
        &mut *self.page.get()
    }

    /// Returns the frame to its pristine Free state. Page bytes are left as
    /// is; the next load or allocation overwrites them.
    pub fn reset(&self) {
        self.pid.store(INVALID_PID, Ordering::Release);
        self.state.store(FrameState::Free as u8, Ordering::Release);
        self.is_wb.store(false, Ordering::Release);
        self.last_written_lsn.store(0, Ordering::Release);
    }
}

impl Default for BufferFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("pid", &self.pid())
            .field("state", &self.state())
            .field("is_wb", &self.is_wb())
            .field("last_written_lsn", &self.last_written_lsn())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_frame_is_free_and_unassigned() {
        let frame = BufferFrame::new();

        assert_eq!(frame.state(), FrameState::Free);
        assert_eq!(frame.pid(), INVALID_PID);
        assert!(!frame.is_wb());
        assert_eq!(frame.last_written_lsn(), 0);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn dirtiness_tracks_lsn_versus_last_written() {
        let frame = BufferFrame::new();
        assert!(!frame.is_dirty());

        {
            let _x = frame.latch().exclusive();
            // SAFETY: exclusive latch held.
            unsafe { frame.page_mut() }.bump_lsn();
        }
        assert!(frame.is_dirty());

        frame.set_last_written_lsn(frame.page().lsn());
        assert!(!frame.is_dirty());
    }

    #[test]
    fn state_transitions_round_trip() {
        let frame = BufferFrame::new();

        frame.set_state(FrameState::Hot);
        assert_eq!(frame.state(), FrameState::Hot);

        frame.set_state(FrameState::Cold);
        assert_eq!(frame.state(), FrameState::Cold);

        frame.set_state(FrameState::Free);
        assert_eq!(frame.state(), FrameState::Free);
    }

    #[test]
    fn reset_clears_residency_metadata() {
        let frame = BufferFrame::new();
        frame.set_pid(17);
        frame.set_state(FrameState::Cold);
        frame.set_wb(true);
        frame.set_last_written_lsn(9);

        frame.reset();

        assert_eq!(frame.pid(), INVALID_PID);
        assert_eq!(frame.state(), FrameState::Free);
        assert!(!frame.is_wb());
        assert_eq!(frame.last_written_lsn(), 0);
    }

    #[test]
    fn exclusive_mutation_invalidates_optimistic_readers() {
        let frame = BufferFrame::new();
        let guard = frame.latch().optimistic_or_spin();
        let _ = frame.page().lsn();

        {
            let _x = frame.latch().exclusive();
            // SAFETY: exclusive latch held.
            unsafe { frame.page_mut() }.bump_lsn();
        }

        assert!(guard.recheck().is_err());
    }
}
