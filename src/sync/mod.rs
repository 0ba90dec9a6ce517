//! # Synchronization Primitives
//!
//! This module provides the versioned latch that protects every buffer frame
//! and tree root slot, together with the `Restart` conflict signal that
//! traversals use instead of blocking.
//!
//! ## Optimistic Validation
//!
//! Readers snapshot a latch version, read the protected data without writing
//! to shared cache lines, and validate the snapshot afterwards. A failed
//! validation means the data was (or may have been) mutated concurrently and
//! the observed values cannot be trusted; the reader signals `Restart` and
//! the top-level operation retries from scratch.
//!
//! ## Module Organization
//!
//! - `latch`: `VersionLock` and its guard types

mod latch;

pub use latch::{
    ExclusiveGuard, OptimisticGuard, SharedGuard, UpgradedGuard, VersionLock,
};

/// Error carried by internal buffer-manager and tree operations.
///
/// `Restart` is a control-flow signal, not a failure: it means optimistically
/// observed state went stale and the operation must be retried from the top.
/// It is caught in exactly three places (the top-level tree operations, the
/// page-provider loop, and the checkpoint loop) and never surfaced to
/// callers. `Fatal` wraps a real error and propagates.
#[derive(Debug)]
pub enum OpError {
    Restart,
    Fatal(eyre::Report),
}

pub type OpResult<T> = Result<T, OpError>;

impl From<eyre::Report> for OpError {
    fn from(report: eyre::Report) -> Self {
        OpError::Fatal(report)
    }
}

impl OpError {
    pub fn is_restart(&self) -> bool {
        matches!(self, OpError::Restart)
    }
}
