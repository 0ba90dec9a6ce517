//! # Versioned Latch
//!
//! A 64-bit latch word supporting optimistic-shared, pessimistic-shared, and
//! exclusive access with a version counter.
//!
//! ## Word Layout
//!
//! ```text
//! Bit     0      Exclusive-held flag
//! Bits  1..=15   Shared-holder count (pessimistic readers)
//! Bits 16..=63   Version, incremented on every exclusive release
//! ```
//!
//! ## Access Modes
//!
//! - **Optimistic shared**: spin until the exclusive bit clears, snapshot the
//!   version, read, then `recheck()`. No write to the latch word, so hot-path
//!   readers never contend on the cache line.
//! - **Pessimistic shared**: bump the shared count; excludes exclusive
//!   holders. Used where a reader cannot tolerate a restart.
//! - **Exclusive**: set the exclusive bit; release increments the version so
//!   every outstanding optimistic snapshot goes stale.
//!
//! Upgrading an optimistic guard to exclusive is a single compare-exchange
//! that only succeeds if the version is still the snapshot and no pessimistic
//! reader is present; failure is reported as `Restart`, never waited out.
//!
//! Fairness is best-effort: a frustrated optimistic reader spins. Writers are
//! serialized per latch by the exclusive bit.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{OpError, OpResult};

const EXCLUSIVE_BIT: u64 = 1;
const SHARED_SHIFT: u32 = 1;
const SHARED_BITS: u32 = 15;
const SHARED_UNIT: u64 = 1 << SHARED_SHIFT;
const SHARED_MASK: u64 = ((1 << SHARED_BITS) - 1) << SHARED_SHIFT;
const VERSION_SHIFT: u32 = SHARED_SHIFT + SHARED_BITS;

const _: () = assert!(VERSION_SHIFT == 16, "latch word layout drifted");
const _: () = assert!(
    EXCLUSIVE_BIT & SHARED_MASK == 0,
    "shared field must not overlap the exclusive bit"
);

/// The versioned latch word. One per buffer frame and per tree root slot.
#[derive(Debug)]
pub struct VersionLock {
    word: AtomicU64,
}

impl Default for VersionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Raw latch word, for diagnostics.
    pub fn raw(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    pub fn is_exclusive_held(&self) -> bool {
        self.word.load(Ordering::Acquire) & EXCLUSIVE_BIT != 0
    }

    /// Acquires an optimistic guard, spinning while a writer holds the latch.
    ///
    /// Used on the traversal hot path, where the writer critical sections are
    /// short and waiting briefly beats restarting the whole operation.
    pub fn optimistic_or_spin(&self) -> OptimisticGuard<'_> {
        loop {
            let word = self.word.load(Ordering::Acquire);
            if word & EXCLUSIVE_BIT == 0 {
                return OptimisticGuard {
                    lock: self,
                    snapshot: word & !SHARED_MASK,
                };
            }
            std::hint::spin_loop();
        }
    }

    /// Non-blocking optimistic acquisition.
    ///
    /// Background tasks use this instead of [`optimistic_or_spin`]: a task
    /// that feeds the free list must never spin on a latch whose holder may
    /// be waiting for a free frame.
    ///
    /// [`optimistic_or_spin`]: VersionLock::optimistic_or_spin
    pub fn try_optimistic(&self) -> Option<OptimisticGuard<'_>> {
        let word = self.word.load(Ordering::Acquire);
        if word & EXCLUSIVE_BIT == 0 {
            Some(OptimisticGuard {
                lock: self,
                snapshot: word & !SHARED_MASK,
            })
        } else {
            None
        }
    }

    /// Acquires the latch in pessimistic shared mode, spinning out writers.
    pub fn shared(&self) -> SharedGuard<'_> {
        loop {
            let word = self.word.load(Ordering::Acquire);
            if word & EXCLUSIVE_BIT == 0 && word & SHARED_MASK != SHARED_MASK {
                if self
                    .word
                    .compare_exchange_weak(
                        word,
                        word + SHARED_UNIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return SharedGuard { lock: self };
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Acquires the latch exclusively, spinning out readers and writers.
    ///
    /// Only used where contention is impossible by construction, e.g. on a
    /// frame popped from the free list that no swip can reach yet.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        loop {
            let word = self.word.load(Ordering::Acquire);
            if word & (EXCLUSIVE_BIT | SHARED_MASK) == 0
                && self
                    .word
                    .compare_exchange_weak(
                        word,
                        word | EXCLUSIVE_BIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                return ExclusiveGuard { lock: self };
            }
            std::hint::spin_loop();
        }
    }

    fn release_exclusive(&self) {
        let word = self.word.load(Ordering::Relaxed);
        debug_assert!(word & EXCLUSIVE_BIT != 0, "release without exclusive hold");
        let bumped = ((word >> VERSION_SHIFT) + 1) << VERSION_SHIFT;
        self.word.store(bumped, Ordering::Release);
    }

    fn version_word(&self) -> u64 {
        self.word.load(Ordering::Acquire) & !SHARED_MASK
    }
}

/// Snapshot-validated read access. Construction never writes the latch word.
#[derive(Debug)]
pub struct OptimisticGuard<'a> {
    lock: &'a VersionLock,
    snapshot: u64,
}

impl<'a> OptimisticGuard<'a> {
    /// Rebuilds a guard from a latch and a previously sampled snapshot.
    pub(crate) fn from_snapshot(lock: &'a VersionLock, snapshot: u64) -> Self {
        Self { lock, snapshot }
    }

    pub fn latch(&self) -> &'a VersionLock {
        self.lock
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    /// Validates every read made since the snapshot was taken.
    pub fn recheck(&self) -> OpResult<()> {
        if self.lock.version_word() == self.snapshot {
            Ok(())
        } else {
            Err(OpError::Restart)
        }
    }

    /// Attempts to upgrade to exclusive without waiting.
    ///
    /// Succeeds only if the version is still the snapshot and no pessimistic
    /// reader is present. On success the returned scope guard holds the latch
    /// exclusively; dropping it releases, bumps the version, and refreshes
    /// this guard's snapshot so the caller's guard stays valid across its own
    /// mutation.
    pub fn try_upgrade(&mut self) -> OpResult<UpgradedGuard<'_, 'a>> {
        match self.lock.word.compare_exchange(
            self.snapshot,
            self.snapshot | EXCLUSIVE_BIT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(UpgradedGuard { guard: self }),
            Err(_) => Err(OpError::Restart),
        }
    }
}

/// Scoped exclusive access obtained by upgrading an [`OptimisticGuard`].
#[derive(Debug)]
pub struct UpgradedGuard<'g, 'a> {
    guard: &'g mut OptimisticGuard<'a>,
}

impl Drop for UpgradedGuard<'_, '_> {
    fn drop(&mut self) {
        self.guard.lock.release_exclusive();
        self.guard.snapshot = self.guard.lock.version_word();
    }
}

/// Pessimistic shared access. Dropping decrements the shared count.
#[derive(Debug)]
pub struct SharedGuard<'a> {
    lock: &'a VersionLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.word.fetch_sub(SHARED_UNIT, Ordering::AcqRel);
    }
}

/// Standalone exclusive access. Dropping releases and bumps the version.
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    lock: &'a VersionLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}
