//! # Engine Configuration
//!
//! Construction-time configuration for the engine: pool sizes, backing-store
//! location and open mode, and the page provider's tuning knobs. Settings are
//! chainable and validated once, when the engine starts; an invalid
//! combination never produces a running engine.
//!
//! ## Module Organization
//!
//! - [`constants`]: numeric defaults and limits with dependency documentation

pub mod constants;

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};

use constants::{
    DEFAULT_ASYNC_BATCH_SIZE, DEFAULT_BACKGROUND_WRITE_SLEEP_US, DEFAULT_COOLING_THRESHOLD,
    DEFAULT_DRAM_PAGES, DEFAULT_SSD_PAGES, DEFAULT_WRITE_BUFFER_SIZE,
};

/// Configuration for [`Engine::start`](crate::Engine::start).
///
/// Use chained setters to override defaults:
///
/// ```ignore
/// let config = EngineConfig::new("./store.db")
///     .dram_pages(64)
///     .ssd_pages(4096)
///     .cooling_threshold(50);
/// let engine = Engine::start(config)?;
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of in-memory page frames.
    pub dram_pages: u32,
    /// Total page capacity of the backing store.
    pub ssd_pages: u32,
    /// Path of the backing file or block device.
    pub ssd_path: PathBuf,
    /// Truncate the backing file on open.
    pub ssd_truncate: bool,
    /// Free-frame watermark in percent; Phase A runs at or below it.
    pub cooling_threshold: u32,
    /// Write-buffer capacity per background task, in pages.
    pub write_buffer_size: u32,
    /// Frames per Phase B pass and per writeback submission.
    pub async_batch_size: u32,
    /// Background task idle backoff in microseconds.
    pub background_write_sleep_us: u64,
    /// Open the backing store with direct I/O (unix only).
    pub direct_io: bool,
    /// Run the optional checkpointer thread.
    pub checkpoint: bool,
}

impl EngineConfig {
    pub fn new<P: AsRef<Path>>(ssd_path: P) -> Self {
        Self {
            dram_pages: DEFAULT_DRAM_PAGES,
            ssd_pages: DEFAULT_SSD_PAGES,
            ssd_path: ssd_path.as_ref().to_path_buf(),
            ssd_truncate: true,
            cooling_threshold: DEFAULT_COOLING_THRESHOLD,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            async_batch_size: DEFAULT_ASYNC_BATCH_SIZE,
            background_write_sleep_us: DEFAULT_BACKGROUND_WRITE_SLEEP_US,
            direct_io: false,
            checkpoint: false,
        }
    }

    pub fn dram_pages(mut self, pages: u32) -> Self {
        self.dram_pages = pages;
        self
    }

    pub fn ssd_pages(mut self, pages: u32) -> Self {
        self.ssd_pages = pages;
        self
    }

    pub fn ssd_truncate(mut self, truncate: bool) -> Self {
        self.ssd_truncate = truncate;
        self
    }

    pub fn cooling_threshold(mut self, percent: u32) -> Self {
        self.cooling_threshold = percent;
        self
    }

    pub fn write_buffer_size(mut self, pages: u32) -> Self {
        self.write_buffer_size = pages;
        self
    }

    pub fn async_batch_size(mut self, frames: u32) -> Self {
        self.async_batch_size = frames;
        self
    }

    pub fn background_write_sleep_us(mut self, micros: u64) -> Self {
        self.background_write_sleep_us = micros;
        self
    }

    pub fn direct_io(mut self, direct: bool) -> Self {
        self.direct_io = direct;
        self
    }

    pub fn checkpoint(mut self, enabled: bool) -> Self {
        self.checkpoint = enabled;
        self
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.dram_pages > 0, "dram_pages must be nonzero");
        ensure!(self.ssd_pages > 0, "ssd_pages must be nonzero");
        ensure!(
            self.ssd_path.as_os_str().len() > 0,
            "ssd_path must not be empty"
        );
        ensure!(
            self.cooling_threshold <= 100,
            "cooling_threshold {} is a percentage and must be <= 100",
            self.cooling_threshold
        );
        ensure!(self.write_buffer_size > 0, "write_buffer_size must be nonzero");
        ensure!(self.async_batch_size > 0, "async_batch_size must be nonzero");
        ensure!(
            self.async_batch_size <= self.write_buffer_size,
            "async_batch_size {} must be <= write_buffer_size {} or Phase B stalls",
            self.async_batch_size,
            self.write_buffer_size
        );
        Ok(())
    }
}
