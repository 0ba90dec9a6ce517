//! # Buffer Manager
//!
//! The buffer manager owns every DRAM page frame and is the only component
//! that moves pages between memory and storage. User data structures never
//! see page ids directly on the hot path: they hold swips, and dereferencing
//! a swip goes through [`BufferManager::resolve_swip`], which faults the page
//! in if needed.
//!
//! ## Page Lifecycle
//!
//! ```text
//!                 allocate_page / load
//!        Free ───────────────────────────► Hot
//!         ▲                                 │ Phase A: unswizzle,
//!         │ Phase B: reclaim                │ append to cooling FIFO
//!         │ (clean frames only)             ▼
//!        Free ◄──────────────────────────  Cold ──► (dirty: write back first)
//!                                           │
//!                 resolve_swip (Cooling) ───┘ promote back to Hot
//! ```
//!
//! A page in the cooling FIFO is a *second chance* window: it still holds
//! valid bytes, and a traversal that touches it before reclaim promotes it
//! straight back to Hot without I/O.
//!
//! ## Shared State and Lock Order
//!
//! - `reservoir` mutex: free frame stack, free page-id queue. A redundant
//!   atomic free-frame counter allows lock-free pressure reads.
//! - `cooling` mutex (the *global* mutex): the cooling FIFO and the per-page
//!   CIO state table. Every transition that touches both a swip and the
//!   cooling structures happens under it.
//! - Per-frame versioned latches: page contents.
//!
//! Lock order, always: caller's guards (top-down), then frame exclusive
//! upgrades, then the global mutex, then the reservoir mutex. A holder of
//! the global mutex may take the reservoir mutex, never the reverse.
//! Exclusive upgrades are compare-and-swap attempts that fail with a restart
//! rather than block, so the two "directions" a worker and the provider
//! climb the tree in cannot deadlock.
//!
//! ## Module Organization
//!
//! - `frame`: the buffer frame and its residency states
//! - `swip`: tagged page references
//! - `fifo`: the cooling FIFO
//! - `write_buffer`: batched writeback staging
//! - `registry`: data-structure capability records and root slots
//! - `provider`: the background page-provider (and optional checkpointer)

mod fifo;
mod frame;
pub(crate) mod provider;
mod registry;
mod swip;
mod write_buffer;

pub use frame::{BufferFrame, FrameState, INVALID_PID};
pub use registry::{
    DataStructureVtable, DtId, DtType, InstanceMeta, ParentHandler, Registry, RootSlot,
};
pub use swip::{decode, encode_swizzled, encode_unswizzled, Swip, SwipState};
pub use write_buffer::WriteBuffer;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use eyre::{bail, Result};
use parking_lot::Mutex;
use tracing::trace;

use crate::config::constants::{FRAME_RESTART_WAIT_MS, FREE_FRAME_WAIT_TIMEOUT_MS};
use crate::config::EngineConfig;
use crate::storage::DiskFile;
use crate::sync::{ExclusiveGuard, OpError, OpResult, OptimisticGuard};

use fifo::CoolingFifo;

/// Per-page transition state, keyed by page id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CioState {
    /// Not resident and nobody is reading it.
    NotLoaded,
    /// A read from storage is in flight.
    Reading,
    /// Resident in the Cold state; the value names the holding frame.
    Cooling { frame: usize },
}

/// Per-page wait channel for in-flight reads. The loading thread holds
/// `load_mutex` for the duration of the read; waiters block on it and then
/// restart their traversal.
struct CioFrame {
    load_mutex: Mutex<()>,
    readers: AtomicU32,
}

impl CioFrame {
    fn new() -> Self {
        Self {
            load_mutex: Mutex::new(()),
            readers: AtomicU32::new(0),
        }
    }
}

/// State behind the global cooling mutex.
pub(crate) struct CoolingTable {
    pub(crate) states: Box<[CioState]>,
    pub(crate) fifo: CoolingFifo,
}

/// State behind the reservoir mutex.
pub(crate) struct Reservoir {
    pub(crate) free_frames: Vec<usize>,
    pub(crate) free_pids: VecDeque<u64>,
}

/// Engine-wide counters, in the usual atomic-stats shape.
#[derive(Debug, Default)]
pub struct BufferStats {
    pub swizzled_pages: AtomicU64,
    pub unswizzled_pages: AtomicU64,
    pub pages_loaded: AtomicU64,
    pub pages_written: AtomicU64,
    pub frames_reclaimed: AtomicU64,
    pub restarts: AtomicU64,
}

/// Point-in-time copy of [`BufferStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStatsSnapshot {
    pub swizzled_pages: u64,
    pub unswizzled_pages: u64,
    pub pages_loaded: u64,
    pub pages_written: u64,
    pub frames_reclaimed: u64,
    pub restarts: u64,
}

impl BufferStats {
    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            swizzled_pages: self.swizzled_pages.load(Ordering::Relaxed),
            unswizzled_pages: self.unswizzled_pages.load(Ordering::Relaxed),
            pages_loaded: self.pages_loaded.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            frames_reclaimed: self.frames_reclaimed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// A freshly allocated page: Hot, exclusively latched, zeroed.
#[derive(Debug)]
pub struct PageAllocation<'a> {
    pub frame_index: usize,
    pub frame: &'a BufferFrame,
    pub guard: ExclusiveGuard<'a>,
}

/// Owner of the frame arena and all residency state.
pub struct BufferManager {
    config: EngineConfig,
    frames: Box<[BufferFrame]>,
    reservoir: Mutex<Reservoir>,
    free_frame_count: AtomicUsize,
    pub(crate) cooling: Mutex<CoolingTable>,
    cio: Box<[CioFrame]>,
    disk: DiskFile,
    registry: Registry,
    stats: BufferStats,
    keep_running: AtomicBool,
}

impl BufferManager {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let dram_pages = config.dram_pages as usize;
        let ssd_pages = config.ssd_pages as usize;

        let disk = DiskFile::open(
            &config.ssd_path,
            ssd_pages as u64,
            config.ssd_truncate,
            config.direct_io,
        )?;

        let frames: Box<[BufferFrame]> =
            (0..dram_pages).map(|_| BufferFrame::new()).collect();
        let cio: Box<[CioFrame]> = (0..ssd_pages).map(|_| CioFrame::new()).collect();

        let reservoir = Reservoir {
            free_frames: (0..dram_pages).collect(),
            free_pids: (0..ssd_pages as u64).collect(),
        };
        let cooling = CoolingTable {
            states: vec![CioState::NotLoaded; ssd_pages].into_boxed_slice(),
            fifo: CoolingFifo::new(dram_pages),
        };

        Ok(Self {
            config,
            frames,
            reservoir: Mutex::new(reservoir),
            free_frame_count: AtomicUsize::new(dram_pages),
            cooling: Mutex::new(cooling),
            cio,
            disk,
            registry: Registry::new(),
            stats: BufferStats::default(),
            keep_running: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    pub fn disk(&self) -> &DiskFile {
        &self.disk
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, index: usize) -> &BufferFrame {
        &self.frames[index]
    }

    /// Lock-free read of the free-frame count, for pressure checks.
    pub fn free_frame_count(&self) -> usize {
        self.free_frame_count.load(Ordering::Acquire)
    }

    pub(crate) fn keep_running(&self) -> bool {
        self.keep_running.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.keep_running.store(false, Ordering::Release);
    }

    /// True while the free pool is at or below the cooling watermark.
    pub(crate) fn under_pressure(&self) -> bool {
        let free = self.free_frame_count() as u64;
        free * 100 <= u64::from(self.config.cooling_threshold) * u64::from(self.config.dram_pages)
    }

    /// Allocates a fresh page: a never-used page id bound to a free frame.
    ///
    /// The returned frame is Hot, zeroed, and exclusively latched; the caller
    /// initializes it and drops the guard to publish. Fails with a
    /// storage-full error when page ids are exhausted, or when no frame
    /// becomes free within the eviction wait window.
    pub fn allocate_page(&self) -> Result<PageAllocation<'_>> {
        let deadline = Instant::now() + Duration::from_millis(FREE_FRAME_WAIT_TIMEOUT_MS);

        let (frame_index, pid) = loop {
            match self.try_pop_allocation()? {
                Some(popped) => break popped,
                None => {
                    if Instant::now() >= deadline {
                        bail!("storage full: no free frame after eviction wait");
                    }
                    std::thread::yield_now();
                }
            }
        };

        Ok(self.init_allocation(frame_index, pid))
    }

    /// Allocation variant for callers that already hold exclusive latches
    /// (splits). Those latches may be exactly what blocks the provider from
    /// freeing a frame, so instead of waiting this restarts the caller's
    /// operation after a brief grace period. Page-id exhaustion is permanent
    /// and still fails outright.
    pub(crate) fn allocate_page_or_restart(&self) -> OpResult<PageAllocation<'_>> {
        let deadline = Instant::now() + Duration::from_millis(FRAME_RESTART_WAIT_MS);

        let (frame_index, pid) = loop {
            match self.try_pop_allocation()? {
                Some(popped) => break popped,
                None => {
                    if Instant::now() >= deadline {
                        return Err(OpError::Restart);
                    }
                    std::thread::yield_now();
                }
            }
        };

        Ok(self.init_allocation(frame_index, pid))
    }

    fn try_pop_allocation(&self) -> Result<Option<(usize, u64)>> {
        let mut reservoir = self.reservoir.lock();
        if reservoir.free_pids.is_empty() {
            bail!("storage full: all {} page ids allocated", self.config.ssd_pages);
        }
        if let Some(frame_index) = reservoir.free_frames.pop() {
            let pid = reservoir.free_pids.pop_front().expect("checked nonempty");
            self.free_frame_count.fetch_sub(1, Ordering::AcqRel);
            Ok(Some((frame_index, pid)))
        } else {
            Ok(None)
        }
    }

    fn init_allocation(&self, frame_index: usize, pid: u64) -> PageAllocation<'_> {
        let frame = &self.frames[frame_index];
        let guard = frame.latch().exclusive();
        // SAFETY: exclusive latch held, and the frame came off the free list
        // so no swip can reach it yet.
        let page = unsafe { frame.page_mut() };
        page.zero();
        frame.set_pid(pid);
        frame.set_state(FrameState::Hot);
        frame.set_wb(false);
        frame.set_last_written_lsn(page.lsn());

        trace!(pid, frame = frame_index, "allocated page");
        PageAllocation {
            frame_index,
            frame,
            guard,
        }
    }

    /// Produces a resident frame for a swip the caller is about to follow.
    ///
    /// `parent_guard` protects the page (or root slot) holding the swip; it
    /// is revalidated at every step so the caller can trust the returned
    /// frame index, and it is upgraded in place when a Cooling page is
    /// promoted. Faulting paths publish the page as Cooling and then
    /// restart, so the swizzle itself always happens on a retry that
    /// revalidates the whole path.
    pub fn resolve_swip(
        &self,
        parent_guard: &mut OptimisticGuard<'_>,
        swip: &Swip,
    ) -> OpResult<usize> {
        // Single load: the word may flip concurrently, and the recheck below
        // is what validates whichever form we decoded.
        if let SwipState::Swizzled { frame } = decode(swip.load_raw()) {
            parent_guard.recheck()?;
            return Ok(frame);
        }

        let mut cooling = self.cooling.lock();
        parent_guard.recheck()?;

        // The swip cannot have been swizzled behind a still-valid guard;
        // swizzling bumps the parent version.
        debug_assert!(!swip.is_swizzled());
        let pid = swip.pid();
        let cio = &self.cio[pid as usize];

        let state = cooling.states[pid as usize];
        match state {
            CioState::NotLoaded => {
                cio.readers.fetch_add(1, Ordering::AcqRel);
                cooling.states[pid as usize] = CioState::Reading;
                let load_guard = cio.load_mutex.lock();
                drop(cooling);

                let result = self.load_page(pid);

                let mut cooling = self.cooling.lock();
                match &result {
                    Ok(frame_index) => {
                        cooling.states[pid as usize] = CioState::Cooling { frame: *frame_index };
                        cooling.fifo.push_back(*frame_index);
                    }
                    Err(_) => {
                        cooling.states[pid as usize] = CioState::NotLoaded;
                    }
                }
                drop(cooling);
                drop(load_guard);
                cio.readers.fetch_sub(1, Ordering::AcqRel);

                match result {
                    // The page is now Cooling; the retried traversal promotes it.
                    Ok(_) => Err(OpError::Restart),
                    Err(err) => Err(err),
                }
            }
            CioState::Reading => {
                cio.readers.fetch_add(1, Ordering::AcqRel);
                drop(cooling);
                // Pure wait for the in-flight read, then retry from the top.
                drop(cio.load_mutex.lock());
                cio.readers.fetch_sub(1, Ordering::AcqRel);
                Err(OpError::Restart)
            }
            CioState::Cooling { frame: frame_index } => {
                let frame = &self.frames[frame_index];
                {
                    let _parent_exclusive = parent_guard.try_upgrade()?;
                    debug_assert_eq!(frame.pid(), pid);
                    debug_assert!(cooling.fifo.contains(frame_index));
                    cooling.fifo.unlink(frame_index);
                    cooling.states[pid as usize] = CioState::NotLoaded;
                    frame.set_state(FrameState::Hot);
                    swip.swizzle(frame_index);
                    self.stats.swizzled_pages.fetch_add(1, Ordering::Relaxed);
                }
                drop(cooling);
                trace!(pid, frame = frame_index, "promoted cooling page");
                Ok(frame_index)
            }
        }
    }

    /// Synchronous fault of page `pid` into a free frame, returned in the
    /// Cold state ready to be published as Cooling.
    fn load_page(&self, pid: u64) -> OpResult<usize> {
        let frame_index = self.pop_free_frame()?;
        let frame = &self.frames[frame_index];

        let guard = frame.latch().exclusive();
        // SAFETY: exclusive latch held on a frame off the free list.
        let page = unsafe { frame.page_mut() };
        if let Err(err) = self.disk.read_page(pid, page) {
            // Fatal for this resolve; the frame itself is still pristine.
            drop(guard);
            self.push_free_frame(frame_index);
            return Err(OpError::Fatal(err));
        }
        if let Some(vtable) = self.registry.vtable(page.dt_type()) {
            (vtable.deserialize)(page);
        }
        frame.set_pid(pid);
        frame.set_state(FrameState::Cold);
        frame.set_wb(false);
        frame.set_last_written_lsn(page.lsn());
        drop(guard);

        self.stats.pages_loaded.fetch_add(1, Ordering::Relaxed);
        trace!(pid, frame = frame_index, "loaded page from storage");
        Ok(frame_index)
    }

    fn pop_free_frame(&self) -> OpResult<usize> {
        let deadline = Instant::now() + Duration::from_millis(FREE_FRAME_WAIT_TIMEOUT_MS);
        loop {
            {
                let mut reservoir = self.reservoir.lock();
                if let Some(frame_index) = reservoir.free_frames.pop() {
                    self.free_frame_count.fetch_sub(1, Ordering::AcqRel);
                    return Ok(frame_index);
                }
            }
            if Instant::now() >= deadline {
                return Err(OpError::Fatal(eyre::eyre!(
                    "storage full: no free frame after eviction wait"
                )));
            }
            std::thread::yield_now();
        }
    }

    pub(crate) fn push_free_frame(&self, frame_index: usize) {
        self.frames[frame_index].reset();
        let mut reservoir = self.reservoir.lock();
        reservoir.free_frames.push(frame_index);
        self.free_frame_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns a fresh, never-published allocation to the pools. Used when a
    /// multi-page operation (a root split) gets only half its allocations.
    pub(crate) fn free_allocation(&self, allocation: PageAllocation<'_>) {
        let PageAllocation {
            frame_index,
            frame,
            guard,
        } = allocation;
        let pid = frame.pid();
        frame.reset();
        drop(guard);

        let mut reservoir = self.reservoir.lock();
        reservoir.free_frames.push(frame_index);
        reservoir.free_pids.push_back(pid);
        self.free_frame_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Dispatches `find_parent` for the instance owning `target`.
    pub(crate) fn find_parent(&self, dt_id: DtId, target: usize) -> OpResult<ParentHandler<'_>> {
        let meta = self.registry.instance(dt_id).ok_or(OpError::Restart)?;
        let vtable = self.registry.vtable(meta.dt_type).ok_or(OpError::Restart)?;
        (vtable.find_parent)(self, dt_id, target)
    }

    /// Copies a frame's page into `dst` in storable form via the owning
    /// structure's serialize hook.
    pub(crate) fn serialize_frame_into(&self, frame_index: usize, dst: &mut crate::storage::Page) {
        let frame = &self.frames[frame_index];
        let page = frame.page();
        match self.registry.vtable(page.dt_type()) {
            Some(vtable) => (vtable.serialize)(self, page, dst),
            None => dst.copy_from(page),
        }
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("frames", &self.frames.len())
            .field("free_frames", &self.free_frame_count())
            .field("ssd_pages", &self.config.ssd_pages)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_manager(dram: u32, ssd: u32) -> (tempfile::TempDir, BufferManager) {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new(dir.path().join("pool.db"))
            .dram_pages(dram)
            .ssd_pages(ssd);
        let bm = BufferManager::new(config).unwrap();
        (dir, bm)
    }

    /// Mimics what Phase A does to a Hot frame, without a provider thread.
    fn demote(bm: &BufferManager, allocation_frame: usize, holder: &Swip) {
        let frame = bm.frame(allocation_frame);
        let pid = frame.pid();
        let mut cooling = bm.cooling.lock();
        holder.unswizzle(pid);
        cooling.states[pid as usize] = CioState::Cooling {
            frame: allocation_frame,
        };
        cooling.fifo.push_back(allocation_frame);
        frame.set_state(FrameState::Cold);
    }

    #[test]
    fn allocate_assigns_distinct_pids_and_hot_state() {
        let (_dir, bm) = test_manager(4, 16);

        let a = bm.allocate_page().unwrap();
        let b = bm.allocate_page().unwrap();

        assert_ne!(a.frame.pid(), b.frame.pid());
        assert_eq!(a.frame.state(), FrameState::Hot);
        assert_eq!(b.frame.state(), FrameState::Hot);
        assert_eq!(bm.free_frame_count(), 2);
    }

    #[test]
    fn allocate_fails_when_pids_exhausted() {
        let (_dir, bm) = test_manager(4, 2);

        let _a = bm.allocate_page().unwrap();
        let _b = bm.allocate_page().unwrap();
        let err = bm.allocate_page().unwrap_err();

        assert!(err.to_string().contains("storage full"));
    }

    #[test]
    fn resolve_swizzled_swip_is_a_fast_path() {
        let (_dir, bm) = test_manager(4, 16);

        let allocation = bm.allocate_page().unwrap();
        let frame_index = allocation.frame_index;
        drop(allocation);

        let slot = RootSlot::new(Swip::swizzled(frame_index));
        let mut guard = slot.latch().optimistic_or_spin();
        let resolved = bm.resolve_swip(&mut guard, slot.swip()).unwrap();

        assert_eq!(resolved, frame_index);
    }

    #[test]
    fn resolve_restarts_on_stale_parent_guard() {
        let (_dir, bm) = test_manager(4, 16);

        let allocation = bm.allocate_page().unwrap();
        let frame_index = allocation.frame_index;
        drop(allocation);

        let slot = RootSlot::new(Swip::swizzled(frame_index));
        let mut guard = slot.latch().optimistic_or_spin();
        drop(slot.latch().exclusive());

        let result = bm.resolve_swip(&mut guard, slot.swip());
        assert!(matches!(result, Err(OpError::Restart)));
    }

    #[test]
    fn cooling_page_is_promoted_without_io() {
        let (_dir, bm) = test_manager(4, 16);

        let allocation = bm.allocate_page().unwrap();
        let frame_index = allocation.frame_index;
        let pid = allocation.frame.pid();
        drop(allocation);

        let slot = RootSlot::new(Swip::swizzled(frame_index));
        demote(&bm, frame_index, slot.swip());
        assert_eq!(bm.frame(frame_index).state(), FrameState::Cold);

        let loads_before = bm.stats().snapshot().pages_loaded;
        let mut guard = slot.latch().optimistic_or_spin();
        let resolved = bm.resolve_swip(&mut guard, slot.swip()).unwrap();

        assert_eq!(resolved, frame_index);
        assert_eq!(bm.frame(frame_index).pid(), pid);
        assert_eq!(bm.frame(frame_index).state(), FrameState::Hot);
        assert!(slot.swip().is_swizzled());
        assert_eq!(bm.stats().snapshot().pages_loaded, loads_before);
        assert!(bm.cooling.lock().fifo.is_empty());
    }

    #[test]
    fn not_loaded_page_is_read_published_cooling_then_restarts() {
        let (_dir, bm) = test_manager(4, 16);

        // Materialize a page on storage.
        let pid;
        {
            let allocation = bm.allocate_page().unwrap();
            pid = allocation.frame.pid();
            // SAFETY: exclusive latch held via the allocation guard.
            let page = unsafe { allocation.frame.page_mut() };
            page.bump_lsn();
            page.payload_mut()[0] = 0xCD;
            bm.disk().write_page(pid, page).unwrap();
            let frame_index = allocation.frame_index;
            drop(allocation);
            // Evict it completely.
            bm.push_free_frame(frame_index);
        }

        let slot = RootSlot::new(Swip::unswizzled(pid));
        let mut guard = slot.latch().optimistic_or_spin();
        let result = bm.resolve_swip(&mut guard, slot.swip());
        assert!(matches!(result, Err(OpError::Restart)));

        // Second attempt finds it Cooling and promotes.
        let mut guard = slot.latch().optimistic_or_spin();
        let frame_index = bm.resolve_swip(&mut guard, slot.swip()).unwrap();

        let frame = bm.frame(frame_index);
        assert_eq!(frame.pid(), pid);
        assert_eq!(frame.state(), FrameState::Hot);
        assert_eq!(frame.page().payload()[0], 0xCD);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn swip_identity_is_preserved_across_demote_and_promote() {
        let (_dir, bm) = test_manager(4, 16);

        let allocation = bm.allocate_page().unwrap();
        let frame_index = allocation.frame_index;
        let pid = allocation.frame.pid();
        drop(allocation);

        let slot = RootSlot::new(Swip::swizzled(frame_index));
        demote(&bm, frame_index, slot.swip());
        assert_eq!(slot.swip().pid(), pid);

        let mut guard = slot.latch().optimistic_or_spin();
        let resolved = bm.resolve_swip(&mut guard, slot.swip()).unwrap();
        assert_eq!(bm.frame(resolved).pid(), pid);
    }

    #[test]
    fn under_pressure_follows_the_watermark() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new(dir.path().join("pool.db"))
            .dram_pages(4)
            .ssd_pages(16)
            .cooling_threshold(50);
        let bm = BufferManager::new(config).unwrap();

        assert!(!bm.under_pressure());

        let _a = bm.allocate_page().unwrap();
        let _b = bm.allocate_page().unwrap();
        // 2 of 4 free == 50%, at the watermark.
        assert!(bm.under_pressure());
    }
}
