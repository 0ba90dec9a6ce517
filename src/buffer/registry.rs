//! # Data-Structure Registry
//!
//! The buffer manager is generic over the data structures living in its
//! pages. Each structure type registers a small capability record of plain
//! function pointers, and each structure instance registers its identity and
//! root slot. The page provider uses the capabilities to traverse user
//! structures without knowing their layout:
//!
//! - `iterate_children`: visit the child swips of a node, so Phase A can
//!   descend toward leaves and prove a victim has no swizzled children.
//! - `find_parent`: locate the swip that names a resident frame, so Phase A
//!   can unswizzle it.
//! - `serialize` / `deserialize`: fix a page copy up for storage (e.g.
//!   replace any swizzled swip with its page id) and after a load.
//!
//! ## Root Slots
//!
//! The root of an instance is itself a swip, held outside any page in a
//! `RootSlot` with its own versioned latch. That gives the root pointer the
//! same guard discipline as an in-page swip: traversals take an optimistic
//! guard on the slot, and the provider can unswizzle even the root.

use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::storage::Page;
use crate::sync::{OptimisticGuard, OpResult, VersionLock};

use super::frame::BufferFrame;
use super::swip::Swip;
use super::BufferManager;

/// Data-structure type tag, stored in every page header.
pub type DtType = u8;

/// Data-structure instance id, stored in every page header.
pub type DtId = u64;

/// Holder of an instance's root swip, latched like a page.
#[derive(Debug)]
pub struct RootSlot {
    latch: VersionLock,
    swip: Swip,
}

impl RootSlot {
    pub fn new(swip: Swip) -> Self {
        Self {
            latch: VersionLock::new(),
            swip,
        }
    }

    pub fn latch(&self) -> &VersionLock {
        &self.latch
    }

    pub fn swip(&self) -> &Swip {
        &self.swip
    }
}

/// Where a frame's identifying swip lives: an in-page child slot or an
/// instance's root slot.
pub enum ParentRef<'a> {
    Root(Arc<RootSlot>),
    Frame {
        frame: &'a BufferFrame,
        swip: &'a Swip,
    },
}

/// Result of `find_parent`: the parent's latch snapshot plus the swip that
/// names the target frame. The caller upgrades the guard to exclusive before
/// editing the swip.
pub struct ParentHandler<'a> {
    parent: ParentRef<'a>,
    snapshot: u64,
}

impl<'a> ParentHandler<'a> {
    pub fn root(root: Arc<RootSlot>, snapshot: u64) -> Self {
        Self {
            parent: ParentRef::Root(root),
            snapshot,
        }
    }

    pub fn frame(frame: &'a BufferFrame, swip: &'a Swip, snapshot: u64) -> Self {
        Self {
            parent: ParentRef::Frame { frame, swip },
            snapshot,
        }
    }

    pub fn latch(&self) -> &VersionLock {
        match &self.parent {
            ParentRef::Root(root) => root.latch(),
            ParentRef::Frame { frame, .. } => frame.latch(),
        }
    }

    pub fn swip(&self) -> &Swip {
        match &self.parent {
            ParentRef::Root(root) => root.swip(),
            ParentRef::Frame { swip, .. } => swip,
        }
    }

    /// Rebuilds the optimistic guard captured at find time.
    pub fn guard(&self) -> OptimisticGuard<'_> {
        OptimisticGuard::from_snapshot(self.latch(), self.snapshot)
    }
}

/// Capability record of one data-structure type. Plain function pointers so
/// the record is `Copy` and carries no state.
#[derive(Clone, Copy)]
pub struct DataStructureVtable {
    /// Visits each child swip of the node in `page`. The visitor returns
    /// `false` to stop early. Reads are optimistic: the caller revalidates
    /// its guard afterwards and discards everything on restart.
    pub iterate_children: fn(page: &Page, visit: &mut dyn FnMut(&Swip) -> bool),
    /// Locates the swip naming `target` (a frame index) in instance `dt_id`.
    /// Restarts if the topology moved underneath the lookup.
    pub find_parent:
        for<'a> fn(bm: &'a BufferManager, dt_id: DtId, target: usize) -> OpResult<ParentHandler<'a>>,
    /// Copies `src` into `dst` in its storable form (no swizzled swips).
    pub serialize: fn(bm: &BufferManager, src: &Page, dst: &mut Page),
    /// Fixes up a page image freshly read from storage.
    pub deserialize: fn(page: &mut Page),
}

#[derive(Clone)]
pub struct InstanceMeta {
    pub dt_type: DtType,
    pub root: Arc<RootSlot>,
}

/// Type and instance tables. Registration happens at setup time; lookups are
/// read-mostly and cheap.
pub struct Registry {
    types: RwLock<HashMap<DtType, DataStructureVtable>>,
    instances: RwLock<HashMap<DtId, InstanceMeta>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) the capability record for a type tag.
    pub fn register_type(&self, dt_type: DtType, vtable: DataStructureVtable) {
        self.types.write().insert(dt_type, vtable);
    }

    /// Registers an instance with its initial root swip.
    pub fn register_instance(
        &self,
        dt_id: DtId,
        dt_type: DtType,
        root: Swip,
    ) -> Result<Arc<RootSlot>> {
        ensure!(
            self.types.read().contains_key(&dt_type),
            "data-structure type {} is not registered",
            dt_type
        );

        let slot = Arc::new(RootSlot::new(root));
        let mut instances = self.instances.write();
        ensure!(
            !instances.contains_key(&dt_id),
            "data-structure instance {} is already registered",
            dt_id
        );
        instances.insert(
            dt_id,
            InstanceMeta {
                dt_type,
                root: Arc::clone(&slot),
            },
        );
        Ok(slot)
    }

    pub fn vtable(&self, dt_type: DtType) -> Option<DataStructureVtable> {
        self.types.read().get(&dt_type).copied()
    }

    pub fn instance(&self, dt_id: DtId) -> Option<InstanceMeta> {
        self.instances.read().get(&dt_id).cloned()
    }

    /// Capability record plus root slot of an instance, in one lookup pair.
    pub fn vtable_for_instance(&self, dt_id: DtId) -> Option<(DataStructureVtable, Arc<RootSlot>)> {
        let meta = self.instance(dt_id)?;
        let vtable = self.vtable(meta.dt_type)?;
        Some((vtable, meta.root))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
