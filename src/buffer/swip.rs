//! # Swips
//!
//! A swip is the 64-bit reference a page uses to name another page. It has
//! two forms, discriminated by the low tag bit:
//!
//! ```text
//! raw & 1 == 1   swizzled:   raw >> 1 is the frame's index in the arena
//! raw & 1 == 0   unswizzled: raw >> 1 is the 63-bit page id on storage
//! ```
//!
//! A swip is swizzled exactly while its target page is resident in the Hot
//! state; resolving an unswizzled swip goes through the buffer manager, which
//! may fault the page in from storage.
//!
//! The word is atomic so traversals can read it under an optimistic guard,
//! but a decoded value is only trustworthy after the guard's `recheck`.
//! Mutation (`swizzle`/`unswizzle`) is restricted by protocol to holders of
//! the owning page's exclusive latch inside the buffer manager's global
//! cooling mutex.

use std::sync::atomic::{AtomicU64, Ordering};

const SWIZZLED_TAG: u64 = 0x1;
const VALUE_SHIFT: u32 = 1;

/// Maximum page id encodable in the tagged representation.
pub const MAX_PID: u64 = u64::MAX >> VALUE_SHIFT;

/// Decoded form of a swip word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipState {
    /// Resident target: index of the frame in the buffer manager's arena.
    Swizzled { frame: usize },
    /// On-storage target: page id.
    Unswizzled { pid: u64 },
}

/// Tagged page reference stored inside pages and root slots.
#[repr(transparent)]
pub struct Swip {
    raw: AtomicU64,
}

impl Swip {
    pub fn unswizzled(pid: u64) -> Self {
        debug_assert!(pid <= MAX_PID);
        Self {
            raw: AtomicU64::new(pid << VALUE_SHIFT),
        }
    }

    pub fn swizzled(frame: usize) -> Self {
        Self {
            raw: AtomicU64::new(encode_swizzled(frame)),
        }
    }

    pub fn load_raw(&self) -> u64 {
        self.raw.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SwipState {
        decode(self.load_raw())
    }

    pub fn is_swizzled(&self) -> bool {
        self.load_raw() & SWIZZLED_TAG != 0
    }

    /// Frame index of a swizzled swip. Meaningless on an unswizzled word;
    /// callers validate with their guard's recheck before trusting it.
    pub fn frame_index(&self) -> usize {
        let raw = self.load_raw();
        debug_assert!(raw & SWIZZLED_TAG != 0, "frame_index on unswizzled swip");
        (raw >> VALUE_SHIFT) as usize
    }

    /// Page id of an unswizzled swip.
    pub fn pid(&self) -> u64 {
        let raw = self.load_raw();
        debug_assert!(raw & SWIZZLED_TAG == 0, "pid on swizzled swip");
        raw >> VALUE_SHIFT
    }

    /// Points the swip at a resident frame. Caller holds the owning page's
    /// exclusive latch and the global cooling mutex.
    pub fn swizzle(&self, frame: usize) {
        self.raw.store(encode_swizzled(frame), Ordering::Release);
    }

    /// Reverts the swip to the on-storage page id. Same locking contract as
    /// [`swizzle`](Swip::swizzle).
    pub fn unswizzle(&self, pid: u64) {
        debug_assert!(pid <= MAX_PID);
        self.raw.store(pid << VALUE_SHIFT, Ordering::Release);
    }
}

impl std::fmt::Debug for Swip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state() {
            SwipState::Swizzled { frame } => write!(f, "Swip(frame:{})", frame),
            SwipState::Unswizzled { pid } => write!(f, "Swip(pid:{})", pid),
        }
    }
}

/// Encodes a swizzled word for writing into page bytes.
pub fn encode_swizzled(frame: usize) -> u64 {
    let raw = (frame as u64) << VALUE_SHIFT;
    debug_assert_eq!(raw >> VALUE_SHIFT, frame as u64, "frame index overflow");
    raw | SWIZZLED_TAG
}

/// Decodes a raw swip word read out of page bytes.
pub fn decode(raw: u64) -> SwipState {
    if raw & SWIZZLED_TAG != 0 {
        SwipState::Swizzled {
            frame: (raw >> VALUE_SHIFT) as usize,
        }
    } else {
        SwipState::Unswizzled {
            pid: raw >> VALUE_SHIFT,
        }
    }
}

/// Encodes an unswizzled word for writing into page bytes.
pub fn encode_unswizzled(pid: u64) -> u64 {
    debug_assert!(pid <= MAX_PID);
    pid << VALUE_SHIFT
}
