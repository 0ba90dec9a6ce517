//! # Configuration Constants
//!
//! Centralized numeric defaults and limits, grouped by functional area.
//! Interdependent values are co-located and checked with compile-time
//! assertions so they cannot drift apart silently.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (24 bytes, fixed by the on-disk format)
//!       │
//!       └─> PAGE_PAYLOAD_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!
//! DEFAULT_WRITE_BUFFER_SIZE (100)
//!       │
//!       └─> DEFAULT_ASYNC_BATCH_SIZE (must be <=)
//!             Phase B enqueues up to one batch of dirty frames before it
//!             submits. If the batch could exceed the write buffer's
//!             capacity, Phase B would stall with frames marked for
//!             writeback that can never be queued.
//!
//! DEFAULT_COOLING_THRESHOLD (90, percent)
//!       │
//!       └─> Phase A runs while free frames <= this fraction of dram_pages
//! ```

// ============================================================================
// POOL SIZING DEFAULTS
// ============================================================================

/// Default number of in-memory page frames.
pub const DEFAULT_DRAM_PAGES: u32 = 10_000;

/// Default total page capacity of the backing store.
pub const DEFAULT_SSD_PAGES: u32 = 100_000;

// ============================================================================
// PAGE PROVIDER CONFIGURATION
// These constants are tightly coupled - changing one may require changing others
// ============================================================================

/// Free-frame watermark, in percent of `dram_pages`. While the free count is
/// at or below this fraction, Phase A unswizzles pages into the cooling FIFO.
pub const DEFAULT_COOLING_THRESHOLD: u32 = 90;

/// Capacity of a background task's write buffer, in pages.
pub const DEFAULT_WRITE_BUFFER_SIZE: u32 = 100;

/// Frames processed per Phase B pass and per writeback submission.
pub const DEFAULT_ASYNC_BATCH_SIZE: u32 = 10;

/// Idle backoff for background tasks when there is no pressure, in
/// microseconds.
pub const DEFAULT_BACKGROUND_WRITE_SLEEP_US: u64 = 10;

const _: () = assert!(
    DEFAULT_ASYNC_BATCH_SIZE <= DEFAULT_WRITE_BUFFER_SIZE,
    "DEFAULT_ASYNC_BATCH_SIZE must be <= DEFAULT_WRITE_BUFFER_SIZE or Phase B stalls"
);

const _: () = assert!(
    DEFAULT_COOLING_THRESHOLD <= 100,
    "DEFAULT_COOLING_THRESHOLD is a percentage"
);

// ============================================================================
// BACKGROUND TASK LIMITS
// ============================================================================

/// Maximum child-descent depth per Phase A victim before the provider
/// re-seeds a fresh random frame. Bounds the time a single iteration can
/// chase swizzled children down a deep structure.
pub const MAX_COOL_DESCENT: usize = 8;

/// Consecutive unusable Phase A victims before the provider yields to
/// Phase B anyway, so writeback and reclamation cannot starve.
pub const MAX_COOL_ATTEMPTS: usize = 128;

/// How long `allocate_page` and a faulting `resolve_swip` will wait for the
/// page provider to produce a free frame before reporting storage full, in
/// milliseconds.
pub const FREE_FRAME_WAIT_TIMEOUT_MS: u64 = 5_000;

/// How long an allocation made under held exclusive latches (a split) waits
/// for a free frame before restarting the whole operation instead. The
/// caller's latches may be exactly what blocks the provider's parent walk,
/// so waiting longer cannot help.
pub const FRAME_RESTART_WAIT_MS: u64 = 10;
