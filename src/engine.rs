//! # Engine Handle
//!
//! `Engine` ties the pieces together: it owns the buffer manager and the
//! background threads, and is the handle a host process links against. There
//! is deliberately no process-wide singleton; everything hangs off an
//! explicit `Engine` value, and data structures capture the shared buffer
//! manager when they are created.
//!
//! ## Lifecycle
//!
//! `start` validates the configuration, opens the backing store, builds the
//! frame arena, and spawns the page-provider thread (plus the checkpointer
//! when configured). `stop` flips the shared stop flag, joins the background
//! threads (each drains its write buffer on the way out), and syncs the
//! backing file. Dropping a running engine stops it best-effort.

use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{eyre, Result, WrapErr};
use tracing::debug;

use crate::buffer::{
    provider, BufferManager, BufferStatsSnapshot, DataStructureVtable, DtId, DtType,
    PageAllocation, RootSlot, Swip,
};
use crate::config::EngineConfig;
use crate::sync::{OpResult, OptimisticGuard};

/// A running storage engine: buffer pool, backing store, background tasks.
pub struct Engine {
    bm: Arc<BufferManager>,
    provider: Option<JoinHandle<()>>,
    checkpointer: Option<JoinHandle<()>>,
}

impl Engine {
    /// Validates `config`, opens the backing store, and starts the
    /// background tasks.
    pub fn start(config: EngineConfig) -> Result<Self> {
        let bm = Arc::new(BufferManager::new(config)?);

        let provider = {
            let bm = Arc::clone(&bm);
            std::thread::Builder::new()
                .name("page-provider".into())
                .spawn(move || provider::page_provider_loop(bm))
                .wrap_err("cannot spawn page provider")?
        };

        let checkpointer = if bm.config().checkpoint {
            let bm = Arc::clone(&bm);
            Some(
                std::thread::Builder::new()
                    .name("checkpointer".into())
                    .spawn(move || provider::checkpointer_loop(bm))
                    .wrap_err("cannot spawn checkpointer")?,
            )
        } else {
            None
        };

        debug!(
            dram_pages = bm.config().dram_pages,
            ssd_pages = bm.config().ssd_pages,
            "engine started"
        );
        Ok(Self {
            bm,
            provider: Some(provider),
            checkpointer,
        })
    }

    /// The shared buffer manager, for data structures that outlive borrows
    /// of the engine.
    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.bm
    }

    /// Registers (or replaces) a data-structure type's capability record.
    pub fn register_datastructure_type(&self, dt_type: DtType, vtable: DataStructureVtable) {
        self.bm.registry().register_type(dt_type, vtable);
    }

    /// Registers a data-structure instance with its initial root swip.
    pub fn register_instance(
        &self,
        dt_id: DtId,
        dt_type: DtType,
        root: Swip,
    ) -> Result<Arc<RootSlot>> {
        self.bm.registry().register_instance(dt_id, dt_type, root)
    }

    /// See [`BufferManager::allocate_page`].
    pub fn allocate_page(&self) -> Result<PageAllocation<'_>> {
        self.bm.allocate_page()
    }

    /// See [`BufferManager::resolve_swip`].
    pub fn resolve_swip(
        &self,
        parent_guard: &mut OptimisticGuard<'_>,
        swip: &Swip,
    ) -> OpResult<usize> {
        self.bm.resolve_swip(parent_guard, swip)
    }

    /// Flushes the backing store to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.bm.disk().sync()
    }

    /// Lock-free view of the free-frame count.
    pub fn free_frame_count(&self) -> usize {
        self.bm.free_frame_count()
    }

    pub fn stats(&self) -> BufferStatsSnapshot {
        self.bm.stats().snapshot()
    }

    /// Stops the background tasks, waits for them to drain, and syncs the
    /// backing store. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.provider.is_none() && self.checkpointer.is_none() {
            return Ok(());
        }
        self.bm.request_stop();

        if let Some(handle) = self.provider.take() {
            handle.join().map_err(|_| eyre!("page provider panicked"))?;
        }
        if let Some(handle) = self.checkpointer.take() {
            handle.join().map_err(|_| eyre!("checkpointer panicked"))?;
        }

        self.bm.disk().sync()?;
        debug!("engine stopped");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("buffer_manager", &self.bm)
            .field("running", &self.provider.is_some())
            .finish()
    }
}
