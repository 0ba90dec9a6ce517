//! # Page Type and Header Layout
//!
//! Every 4 KiB page begins with a 24-byte header followed by a type-specific
//! payload. The header fields:
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ----------------------------------------
//! 0       8     lsn       Monotonically non-decreasing stamp. Used
//!                         only to detect dirtiness: a resident page
//!                         is dirty iff lsn exceeds the frame's
//!                         last-written lsn.
//! 8       1     dt_type   Data-structure type tag (registry key)
//! 9       7     reserved  Zero
//! 16      8     dt_id     Data-structure instance id
//! 24      ...   payload   Node body, interpreted per dt_type
//! ```
//!
//! ## Zero-Copy Access
//!
//! `PageHeader` uses `zerocopy` for safe transmutation, so headers can be
//! inspected directly in a frame or an I/O buffer without copying. The whole
//! `Page` is `#[repr(C, align(4096))]`: no padding, and every page buffer in
//! the frame arena is naturally aligned for direct I/O.
//!
//! ## Thread Safety
//!
//! `Page` is plain data with no synchronization. Concurrent access discipline
//! is provided by the buffer frame's versioned latch; see the buffer module.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{PAGE_HEADER_SIZE, PAGE_PAYLOAD_SIZE, PAGE_SIZE};

/// The fixed page header, transmutable from the first 24 bytes of a page.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageHeader {
    lsn: u64,
    dt_type: u8,
    reserved: [u8; 7],
    dt_id: u64,
}

const _: () = assert!(
    size_of::<PageHeader>() == PAGE_HEADER_SIZE,
    "PageHeader layout drifted from the on-disk format"
);

/// A fixed-size page: header plus payload, the unit of I/O and residency.
#[repr(C, align(4096))]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Page {
    header: PageHeader,
    payload: [u8; PAGE_PAYLOAD_SIZE],
}

const _: () = assert!(size_of::<Page>() == PAGE_SIZE, "Page must be exactly one page");

impl Page {
    pub fn zeroed() -> Self {
        Self {
            header: PageHeader {
                lsn: 0,
                dt_type: 0,
                reserved: [0; 7],
                dt_id: 0,
            },
            payload: [0; PAGE_PAYLOAD_SIZE],
        }
    }

    pub fn lsn(&self) -> u64 {
        self.header.lsn
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.header.lsn = lsn;
    }

    /// Advances the page stamp. Called under the frame's exclusive latch by
    /// every mutation so writeback can tell dirty pages from clean ones.
    pub fn bump_lsn(&mut self) {
        self.header.lsn += 1;
    }

    pub fn dt_type(&self) -> u8 {
        self.header.dt_type
    }

    pub fn set_dt_type(&mut self, dt_type: u8) {
        self.header.dt_type = dt_type;
    }

    pub fn dt_id(&self) -> u64 {
        self.header.dt_id
    }

    pub fn set_dt_id(&mut self, dt_id: u64) {
        self.header.dt_id = dt_id;
    }

    pub fn payload(&self) -> &[u8; PAGE_PAYLOAD_SIZE] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8; PAGE_PAYLOAD_SIZE] {
        &mut self.payload
    }

    pub fn zero(&mut self) {
        self.as_mut_bytes().fill(0);
    }

    /// Byte-for-byte copy from another page.
    pub fn copy_from(&mut self, src: &Page) {
        self.as_mut_bytes().copy_from_slice(src.as_bytes());
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("lsn", &self.lsn())
            .field("dt_type", &self.dt_type())
            .field("dt_id", &self.dt_id())
            .finish_non_exhaustive()
    }
}
