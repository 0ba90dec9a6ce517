//! # Optimistic B+Tree
//!
//! A concurrent B+tree whose nodes are pages allocated from the buffer
//! manager and whose child references are swips. Readers never write to
//! shared state: traversal takes optimistic guards and validates them with
//! lock coupling, so a lookup over a stable working set touches no cache
//! line exclusively.
//!
//! ## Traversal Protocol
//!
//! ```text
//! 1. Optimistic guard on the root slot; resolve the root swip; guard the
//!    root node; revalidate the slot guard.
//! 2. While the current node is inner: pick the child by lowerBound, resolve
//!    its swip (may fault the page in and restart), revalidate, then shift
//!    guards down one level (parent <- current, current <- child).
//! 3. At the leaf: lookups read and revalidate; inserts upgrade the leaf
//!    guard (plus the parent's when splitting) and mutate.
//! ```
//!
//! Any stale version observed anywhere surfaces as a restart, and the
//! top-level operation simply runs again; conflicts are expected to be rare
//! and retries cheap.
//!
//! ## Splits
//!
//! Leaves split on overflow: the upper half moves to a fresh page and the
//! separator (largest key remaining left) is published to the parent. Inner
//! nodes are split *proactively* during descent when one more entry would
//! fill them, which guarantees a parent always has room for a child's
//! separator and avoids a second upward pass. A root split allocates a new
//! inner root under the root-slot latch. Every split restarts the operation
//! so the retry revalidates the new topology from the top.
//!
//! ## Cooperation with the Page Provider
//!
//! The tree registers a capability record so the provider can walk it
//! generically: child iteration (eviction descends toward leaves), parent
//! lookup by routing key (to unswizzle a victim's swip), and the serialize
//! hook that strips swizzled swips from page images headed to storage.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::buffer::{
    decode, encode_swizzled, encode_unswizzled, BufferManager, DataStructureVtable, DtId,
    ParentHandler, RootSlot, Swip, SwipState,
};
use crate::engine::Engine;
use crate::storage::Page;
use crate::sync::{OpError, OpResult};

use super::node::{self, Inner, InnerMut, Leaf, LeafMut, INNER_MAX_ENTRIES, LEAF_MAX_ENTRIES};

/// Registry type tag for B+tree pages.
pub const BTREE_DT_TYPE: u8 = 1;

/// Handle to one tree instance. Cheap to clone; operations take `&self` and
/// are safe to call from any thread.
#[derive(Clone)]
pub struct BTree {
    bm: Arc<BufferManager>,
    dt_id: DtId,
    root: Arc<RootSlot>,
    leaf_capacity: usize,
    inner_capacity: usize,
}

impl BTree {
    /// Creates an empty tree registered as instance `dt_id`, with node
    /// capacities derived from the page size.
    pub fn create(engine: &Engine, dt_id: DtId) -> Result<Self> {
        Self::create_with_capacities(engine, dt_id, LEAF_MAX_ENTRIES, INNER_MAX_ENTRIES)
    }

    /// Creates an empty tree with clamped node capacities. Smaller
    /// capacities force deeper trees from fewer keys, which is what the
    /// split stress tests are after.
    pub fn create_with_capacities(
        engine: &Engine,
        dt_id: DtId,
        leaf_capacity: usize,
        inner_capacity: usize,
    ) -> Result<Self> {
        ensure!(
            (2..=LEAF_MAX_ENTRIES).contains(&leaf_capacity),
            "leaf capacity {} out of range 2..={}",
            leaf_capacity,
            LEAF_MAX_ENTRIES
        );
        ensure!(
            (4..=INNER_MAX_ENTRIES).contains(&inner_capacity),
            "inner capacity {} out of range 4..={}",
            inner_capacity,
            INNER_MAX_ENTRIES
        );

        let bm = Arc::clone(engine.buffer_manager());
        bm.registry().register_type(BTREE_DT_TYPE, Self::vtable());

        let allocation = bm.allocate_page()?;
        // SAFETY: the allocation holds the frame's exclusive latch.
        let page = unsafe { allocation.frame.page_mut() };
        page.set_dt_type(BTREE_DT_TYPE);
        page.set_dt_id(dt_id);
        LeafMut::init(page);
        page.bump_lsn();

        let root = match bm.registry().register_instance(
            dt_id,
            BTREE_DT_TYPE,
            Swip::swizzled(allocation.frame_index),
        ) {
            Ok(root) => root,
            Err(err) => {
                bm.free_allocation(allocation);
                return Err(err);
            }
        };
        drop(allocation);

        Ok(Self {
            bm,
            dt_id,
            root,
            leaf_capacity,
            inner_capacity,
        })
    }

    pub fn dt_id(&self) -> DtId {
        self.dt_id
    }

    /// Inserts `key` with `value`; an existing key is overwritten.
    ///
    /// Restarts are retried internally. A real failure (storage full during
    /// a split, I/O error faulting a node in) propagates.
    pub fn insert(&self, key: u64, value: u64) -> Result<()> {
        loop {
            match self.try_insert(key, value) {
                Ok(()) => return Ok(()),
                Err(OpError::Restart) => self.note_restart(),
                Err(OpError::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Point lookup.
    pub fn lookup(&self, key: u64) -> Result<Option<u64>> {
        loop {
            match self.try_lookup(key) {
                Ok(found) => return Ok(found),
                Err(OpError::Restart) => self.note_restart(),
                Err(OpError::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Number of levels from the root down to (and including) the leaves.
    pub fn height(&self) -> Result<usize> {
        loop {
            match self.try_height() {
                Ok(height) => return Ok(height),
                Err(OpError::Restart) => self.note_restart(),
                Err(OpError::Fatal(err)) => return Err(err),
            }
        }
    }

    fn note_restart(&self) {
        self.bm
            .stats()
            .restarts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn try_lookup(&self, key: u64) -> OpResult<Option<u64>> {
        let bm = &*self.bm;

        let mut p_guard = self.root.latch().optimistic_or_spin();
        let mut c_index = bm.resolve_swip(&mut p_guard, self.root.swip())?;
        let mut c_frame = bm.frame(c_index);
        let mut c_guard = c_frame.latch().optimistic_or_spin();
        p_guard.recheck()?;

        loop {
            let page = c_frame.page();
            let is_inner = node::is_inner(page);
            c_guard.recheck()?;
            if !is_inner {
                break;
            }

            let inner = Inner(page);
            let slot = inner.lower_bound(key)?;
            let child_swip = inner.child_swip(slot);
            c_guard.recheck()?;

            let child_index = bm.resolve_swip(&mut c_guard, child_swip)?;
            c_guard.recheck()?;

            p_guard = c_guard;
            c_index = child_index;
            c_frame = bm.frame(c_index);
            c_guard = c_frame.latch().optimistic_or_spin();
            p_guard.recheck()?;
        }

        let leaf = Leaf(c_frame.page());
        let slot = leaf.lower_bound(key)?;
        let found = if slot < leaf.count() && leaf.key_at(slot) == key {
            Some(leaf.value_at(slot))
        } else {
            None
        };
        c_guard.recheck()?;
        Ok(found)
    }

    fn try_insert(&self, key: u64, value: u64) -> OpResult<()> {
        let bm = &*self.bm;

        let mut p_guard = self.root.latch().optimistic_or_spin();
        let mut p_node: Option<usize> = None;
        let mut c_index = bm.resolve_swip(&mut p_guard, self.root.swip())?;
        let mut c_frame = bm.frame(c_index);
        let mut c_guard = c_frame.latch().optimistic_or_spin();
        p_guard.recheck()?;

        loop {
            let page = c_frame.page();
            let is_inner = node::is_inner(page);
            c_guard.recheck()?;
            if !is_inner {
                break;
            }

            let inner = Inner(page);
            let count = inner.count();
            c_guard.recheck()?;

            // Split inner nodes on the way down, while the parent still has
            // room for the separator.
            if count >= self.inner_capacity - 1 {
                {
                    let _p_exclusive = p_guard.try_upgrade()?;
                    let _c_exclusive = c_guard.try_upgrade()?;
                    self.split_inner(c_index, p_node)?;
                }
                return Err(OpError::Restart);
            }

            let slot = inner.lower_bound(key)?;
            let child_swip = inner.child_swip(slot);
            c_guard.recheck()?;

            let child_index = bm.resolve_swip(&mut c_guard, child_swip)?;
            c_guard.recheck()?;

            p_guard = c_guard;
            p_node = Some(c_index);
            c_index = child_index;
            c_frame = bm.frame(c_index);
            c_guard = c_frame.latch().optimistic_or_spin();
            p_guard.recheck()?;
        }

        let leaf_count = Leaf(c_frame.page()).count();
        c_guard.recheck()?;

        if leaf_count >= self.leaf_capacity {
            {
                let _p_exclusive = p_guard.try_upgrade()?;
                let _c_exclusive = c_guard.try_upgrade()?;
                self.split_leaf(c_index, p_node)?;
            }
            return Err(OpError::Restart);
        }

        let _c_exclusive = c_guard.try_upgrade()?;
        // SAFETY: the upgrade holds this frame's latch exclusively.
        let page = unsafe { c_frame.page_mut() };
        LeafMut(page).insert(key, value);
        page.bump_lsn();
        Ok(())
    }

    fn try_height(&self) -> OpResult<usize> {
        let bm = &*self.bm;

        let mut p_guard = self.root.latch().optimistic_or_spin();
        let mut c_index = bm.resolve_swip(&mut p_guard, self.root.swip())?;
        let mut c_frame = bm.frame(c_index);
        let mut c_guard = c_frame.latch().optimistic_or_spin();
        p_guard.recheck()?;

        let mut levels = 1;
        loop {
            let page = c_frame.page();
            let is_inner = node::is_inner(page);
            c_guard.recheck()?;
            if !is_inner {
                return Ok(levels);
            }

            let child_swip = Inner(page).child_swip(0);
            c_guard.recheck()?;
            let child_index = bm.resolve_swip(&mut c_guard, child_swip)?;
            c_guard.recheck()?;

            p_guard = c_guard;
            c_index = child_index;
            c_frame = bm.frame(c_index);
            c_guard = c_frame.latch().optimistic_or_spin();
            p_guard.recheck()?;
            levels += 1;
        }
    }

    /// Splits the leaf in `leaf_index` and publishes the new sibling.
    /// Caller holds the leaf and its parent (frame or root slot) exclusively.
    fn split_leaf(&self, leaf_index: usize, parent: Option<usize>) -> OpResult<()> {
        // Every allocation happens before the first page mutation: an
        // allocation restart here must leave the tree untouched.
        let sibling = self.bm.allocate_page_or_restart()?;
        let new_root = match parent {
            Some(_) => None,
            None => match self.bm.allocate_page_or_restart() {
                Ok(allocation) => Some(allocation),
                Err(err) => {
                    self.bm.free_allocation(sibling);
                    return Err(err);
                }
            },
        };

        let new_index = sibling.frame_index;
        // SAFETY: allocation guard for the new page; the caller's exclusive
        // upgrades cover the leaf and its parent.
        let new_page = unsafe { sibling.frame.page_mut() };
        new_page.set_dt_type(BTREE_DT_TYPE);
        new_page.set_dt_id(self.dt_id);

        let leaf_page = unsafe { self.bm.frame(leaf_index).page_mut() };
        let separator = LeafMut(leaf_page).split_into(new_page);
        leaf_page.bump_lsn();
        new_page.bump_lsn();

        match parent {
            Some(parent_index) => {
                let parent_page = unsafe { self.bm.frame(parent_index).page_mut() };
                InnerMut(parent_page).insert_separator(separator, encode_swizzled(new_index));
                parent_page.bump_lsn();
            }
            None => {
                let root_allocation = new_root.expect("allocated above for the root case");
                self.install_root(root_allocation, separator, leaf_index, new_index);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Splits the inner node in `inner_index`. Same locking contract as
    /// [`split_leaf`](BTree::split_leaf).
    fn split_inner(&self, inner_index: usize, parent: Option<usize>) -> OpResult<()> {
        let sibling = self.bm.allocate_page_or_restart()?;
        let new_root = match parent {
            Some(_) => None,
            None => match self.bm.allocate_page_or_restart() {
                Ok(allocation) => Some(allocation),
                Err(err) => {
                    self.bm.free_allocation(sibling);
                    return Err(err);
                }
            },
        };

        let new_index = sibling.frame_index;
        // SAFETY: as in split_leaf.
        let new_page = unsafe { sibling.frame.page_mut() };
        new_page.set_dt_type(BTREE_DT_TYPE);
        new_page.set_dt_id(self.dt_id);

        let inner_page = unsafe { self.bm.frame(inner_index).page_mut() };
        let separator = InnerMut(inner_page).split_into(new_page);
        inner_page.bump_lsn();
        new_page.bump_lsn();

        match parent {
            Some(parent_index) => {
                let parent_page = unsafe { self.bm.frame(parent_index).page_mut() };
                InnerMut(parent_page).insert_separator(separator, encode_swizzled(new_index));
                parent_page.bump_lsn();
            }
            None => {
                let root_allocation = new_root.expect("allocated above for the root case");
                self.install_root(root_allocation, separator, inner_index, new_index);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Formats a pre-allocated page as the new inner root over a freshly
    /// split pair and swizzles it into the root slot. Caller holds the root
    /// slot exclusively.
    fn install_root(
        &self,
        allocation: crate::buffer::PageAllocation<'_>,
        separator: u64,
        left_index: usize,
        right_index: usize,
    ) {
        // SAFETY: allocation guard.
        let page = unsafe { allocation.frame.page_mut() };
        page.set_dt_type(BTREE_DT_TYPE);
        page.set_dt_id(self.dt_id);
        InnerMut::init(page, encode_swizzled(left_index));
        InnerMut(page).insert_separator(separator, encode_swizzled(right_index));
        page.bump_lsn();

        self.root.swip().swizzle(allocation.frame_index);
    }

    // ── Registry capabilities ────────────────────────────────────────────

    fn vtable() -> DataStructureVtable {
        DataStructureVtable {
            iterate_children: Self::iterate_children,
            find_parent: Self::find_parent,
            serialize: Self::serialize_page,
            deserialize: Self::deserialize_page,
        }
    }

    /// Visits the child swips of an inner node; leaves have none. Reads are
    /// optimistic: the caller revalidates its guard afterwards.
    fn iterate_children(page: &Page, visit: &mut dyn FnMut(&Swip) -> bool) {
        if !node::is_inner(page) {
            return;
        }
        let inner = Inner(page);
        let count = inner.count();
        if count > INNER_MAX_ENTRIES {
            // Torn count; the caller's recheck will restart it.
            return;
        }
        for slot in 0..=count {
            if !visit(inner.child_swip(slot)) {
                return;
            }
        }
    }

    /// Walks from the root toward `target` (a frame holding one of this
    /// tree's nodes, exclusively latched by the caller) and returns the swip
    /// that names it together with a guard on the page holding that swip.
    fn find_parent<'a>(
        bm: &'a BufferManager,
        dt_id: DtId,
        target: usize,
    ) -> OpResult<ParentHandler<'a>> {
        let Some((_, root)) = bm.registry().vtable_for_instance(dt_id) else {
            return Err(OpError::Restart);
        };

        let root_guard = root.latch().try_optimistic().ok_or(OpError::Restart)?;
        if !root.swip().is_swizzled() {
            return Err(OpError::Restart);
        }
        let root_frame = root.swip().frame_index();
        root_guard.recheck()?;

        if root_frame == target {
            let snapshot = root_guard.snapshot();
            drop(root_guard);
            return Ok(ParentHandler::root(root, snapshot));
        }

        // The caller holds the target exclusively, so its routing key is
        // stable. An empty non-root node cannot exist.
        let key = node::routing_key(bm.frame(target).page()).ok_or(OpError::Restart)?;

        let mut c_frame = bm.frame(root_frame);
        let mut c_guard = c_frame.latch().try_optimistic().ok_or(OpError::Restart)?;
        root_guard.recheck()?;

        loop {
            let page = c_frame.page();
            if !node::is_inner(page) {
                // Reached a leaf without meeting the target: stale walk.
                c_guard.recheck()?;
                return Err(OpError::Restart);
            }

            let inner = Inner(page);
            let slot = inner.lower_bound(key)?;
            let child_swip = inner.child_swip(slot);
            let raw = child_swip.load_raw();
            c_guard.recheck()?;

            match decode(raw) {
                SwipState::Swizzled { frame } if frame == target => {
                    return Ok(ParentHandler::frame(c_frame, child_swip, c_guard.snapshot()));
                }
                SwipState::Swizzled { frame } => {
                    let child_frame = bm.frame(frame);
                    let child_guard =
                        child_frame.latch().try_optimistic().ok_or(OpError::Restart)?;
                    c_guard.recheck()?;
                    c_frame = child_frame;
                    c_guard = child_guard;
                }
                SwipState::Unswizzled { .. } => {
                    // A resident page cannot sit under an unswizzled path.
                    return Err(OpError::Restart);
                }
            }
        }
    }

    /// Storable image of a node: any swizzled child swip in the copy is
    /// replaced by its target's page id.
    fn serialize_page(bm: &BufferManager, src: &Page, dst: &mut Page) {
        dst.copy_from(src);
        if !node::is_inner(dst) {
            return;
        }
        let count = Inner(dst).count().min(INNER_MAX_ENTRIES);
        for slot in 0..=count {
            let raw = Inner(dst).child_raw(slot);
            if let SwipState::Swizzled { frame } = decode(raw) {
                let pid = bm.frame(frame).pid();
                InnerMut(dst).set_child_raw(slot, encode_unswizzled(pid));
            }
        }
    }

    /// On-disk images never contain swizzled swips; nothing to fix up.
    fn deserialize_page(_page: &mut Page) {}
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("dt_id", &self.dt_id)
            .field("leaf_capacity", &self.leaf_capacity)
            .field("inner_capacity", &self.inner_capacity)
            .finish()
    }
}
