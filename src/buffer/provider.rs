//! # Page Provider
//!
//! The page provider is a dedicated background thread with one job: keep the
//! free-frame count above the configured watermark. It alternates strictly
//! between two phases:
//!
//! - **Phase A (unswizzle into cooling).** While the pool is under pressure,
//!   pick a random Hot frame. If it has a swizzled child, descend into the
//!   child instead — repeated, this biases eviction toward leaves, which are
//!   the cheapest pages to fault back in. Once a victim with no swizzled
//!   children is found, latch it and its parent exclusively, unswizzle the
//!   parent's swip under the global mutex, and append the frame to the
//!   cooling FIFO.
//!
//! - **Phase B (drain cooling).** Walk the oldest cooling entries: reclaim
//!   clean frames straight to the free list, stage dirty ones in the write
//!   buffer, then submit the batch outside the locks and complete each write
//!   under the frame latch.
//!
//! Conflicts are expected: every guard acquisition here is non-blocking, and
//! any restart re-seeds a fresh random victim. Descent depth per iteration
//! is capped so a deep structure cannot pin the provider, and a run of
//! unusable victims yields to Phase B so reclamation never starves.
//!
//! The optional checkpointer thread reuses the same write-buffer machinery
//! against random dirty Hot frames, trading write amplification for a
//! shorter dirty tail when eviction eventually reaches those pages.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::config::constants::{MAX_COOL_ATTEMPTS, MAX_COOL_DESCENT};
use crate::sync::{OpError, OpResult};

use super::{BufferManager, CioState, FrameState, WriteBuffer};

/// Main loop of the page-provider thread.
pub(crate) fn page_provider_loop(bm: Arc<BufferManager>) {
    let config = bm.config().clone();
    let mut write_buffer = WriteBuffer::new(config.write_buffer_size as usize);
    let mut rng = rand::thread_rng();
    let backoff = Duration::from_micros(config.background_write_sleep_us.max(1));

    let mut victim = reseed(&mut rng, &bm);
    let mut depth = 0usize;
    let mut attempts = 0usize;
    let mut cooling_phase = true;

    debug!("page provider started");
    while bm.keep_running() {
        if cooling_phase {
            if !bm.under_pressure() {
                std::thread::sleep(backoff);
                cooling_phase = false;
                continue;
            }

            match cool_one_victim(&bm, &mut rng, &mut victim, &mut depth) {
                Ok(true) => {
                    attempts = 0;
                    cooling_phase = false;
                }
                Ok(false) => {
                    attempts += 1;
                }
                Err(OpError::Restart) => {
                    bm.stats().restarts.fetch_add(1, Ordering::Relaxed);
                    victim = reseed(&mut rng, &bm);
                    depth = 0;
                    attempts += 1;
                }
                Err(OpError::Fatal(err)) => {
                    warn!(%err, "page provider cooling pass failed");
                    victim = reseed(&mut rng, &bm);
                    depth = 0;
                    attempts += 1;
                }
            }

            if attempts >= MAX_COOL_ATTEMPTS {
                // Nothing coolable right now; give the workers a moment
                // before hunting again.
                attempts = 0;
                cooling_phase = false;
                std::thread::sleep(backoff);
            }
        } else {
            if let Err(err) = drain_cooling(&bm, &mut write_buffer) {
                warn!(%err, "page provider drain pass failed");
            }
            cooling_phase = true;
        }
    }

    // Leave no frame quarantined behind an unwritten copy.
    if let Err(err) = write_buffer.flush(bm.disk(), |frame, lsn| complete_write(&bm, frame, lsn)) {
        warn!(%err, "page provider final flush failed");
    }
    debug!("page provider stopped");
}

fn reseed(rng: &mut impl Rng, bm: &BufferManager) -> usize {
    rng.gen_range(0..bm.frame_count())
}

/// One Phase A step. Returns `Ok(true)` when a frame entered the cooling
/// FIFO, `Ok(false)` when the victim was unusable or the walk descended into
/// a child.
fn cool_one_victim(
    bm: &BufferManager,
    rng: &mut impl Rng,
    victim: &mut usize,
    depth: &mut usize,
) -> OpResult<bool> {
    let frame = bm.frame(*victim);

    let Some(mut guard) = frame.latch().try_optimistic() else {
        *victim = reseed(rng, bm);
        *depth = 0;
        return Ok(false);
    };

    if frame.state() != FrameState::Hot {
        *victim = reseed(rng, bm);
        *depth = 0;
        return Ok(false);
    }
    guard.recheck()?;

    let dt_id = frame.page().dt_id();
    guard.recheck()?;
    let Some((vtable, _root)) = bm.registry().vtable_for_instance(dt_id) else {
        *victim = reseed(rng, bm);
        *depth = 0;
        return Ok(false);
    };

    let mut swizzled_child = None;
    (vtable.iterate_children)(frame.page(), &mut |swip| {
        if swip.is_swizzled() {
            swizzled_child = Some(swip.frame_index());
            false
        } else {
            true
        }
    });
    guard.recheck()?;

    if let Some(child) = swizzled_child {
        if *depth >= MAX_COOL_DESCENT {
            *victim = reseed(rng, bm);
            *depth = 0;
        } else {
            *victim = child;
            *depth += 1;
        }
        return Ok(false);
    }

    // No swizzled children: this frame can leave the hot set.
    let _victim_exclusive = guard.try_upgrade()?;
    let parent = bm.find_parent(dt_id, *victim)?;
    let mut parent_guard = parent.guard();
    {
        let _parent_exclusive = parent_guard.try_upgrade()?;
        let mut cooling = bm.cooling.lock();

        debug_assert!(parent.swip().is_swizzled());
        debug_assert_eq!(parent.swip().frame_index(), *victim);

        let pid = frame.pid();
        parent.swip().unswizzle(pid);
        cooling.states[pid as usize] = CioState::Cooling { frame: *victim };
        cooling.fifo.push_back(*victim);
        frame.set_state(FrameState::Cold);
        bm.stats().unswizzled_pages.fetch_add(1, Ordering::Relaxed);
        trace!(pid, frame = *victim, "unswizzled into cooling");
    }

    *victim = reseed(rng, bm);
    *depth = 0;
    Ok(true)
}

/// One Phase B step: reclaim or stage up to one batch from the FIFO front,
/// then submit staged writes outside the locks.
fn drain_cooling(bm: &BufferManager, write_buffer: &mut WriteBuffer) -> eyre::Result<()> {
    let batch = bm.config().async_batch_size as usize;

    {
        let mut cooling = bm.cooling.lock();
        let mut processed = 0;
        let mut cursor = cooling.fifo.front();

        while processed < batch {
            let Some(frame_index) = cursor else { break };
            cursor = cooling.fifo.next(frame_index);
            let frame = bm.frame(frame_index);

            if !frame.is_wb() {
                if !frame.is_dirty() {
                    let pid = frame.pid();
                    cooling.fifo.unlink(frame_index);
                    cooling.states[pid as usize] = CioState::NotLoaded;
                    bm.push_free_frame(frame_index);
                    bm.stats().frames_reclaimed.fetch_add(1, Ordering::Relaxed);
                    trace!(pid, frame = frame_index, "reclaimed clean frame");
                } else if !write_buffer.is_full() {
                    frame.set_wb(true);
                    let pid = frame.pid();
                    let lsn = frame.page().lsn();
                    write_buffer.add(frame_index, pid, lsn, |dst| {
                        bm.serialize_frame_into(frame_index, dst)
                    });
                }
            }
            processed += 1;
        }
    }

    // Under pressure every staged copy goes out now; a pool smaller than the
    // batch size could otherwise never reach the submit threshold.
    let written = if bm.under_pressure() {
        write_buffer.flush(bm.disk(), |frame, lsn| complete_write(bm, frame, lsn))?
    } else {
        write_buffer.submit_if_necessary(bm.disk(), batch, |frame, lsn| {
            complete_write(bm, frame, lsn)
        })?
    };
    if written > 0 {
        bm.stats()
            .pages_written
            .fetch_add(written as u64, Ordering::Relaxed);
    }
    Ok(())
}

/// Writeback completion: publish the written LSN and clear the in-flight
/// flag under the frame latch. Retries until the latch is won; the frame
/// cannot be freed while `is_wb` is set, so the loop terminates as soon as a
/// lock acquisition succeeds.
pub(crate) fn complete_write(bm: &BufferManager, frame_index: usize, written_lsn: u64) {
    let frame = bm.frame(frame_index);
    loop {
        let mut guard = frame.latch().optimistic_or_spin();
        let upgrade_result = guard.try_upgrade();
        match upgrade_result {
            Ok(_exclusive) => {
                frame.set_last_written_lsn(written_lsn);
                frame.set_wb(false);
                return;
            }
            Err(_) => std::hint::spin_loop(),
        }
    }
}

/// Main loop of the optional checkpointer thread: write random dirty Hot
/// frames ahead of eviction so Phase B finds them clean.
pub(crate) fn checkpointer_loop(bm: Arc<BufferManager>) {
    let config = bm.config().clone();
    let mut write_buffer = WriteBuffer::new(config.write_buffer_size as usize);
    let mut rng = rand::thread_rng();
    let backoff = Duration::from_micros(config.background_write_sleep_us.max(1));
    let batch = config.async_batch_size as usize;

    debug!("checkpointer started");
    while bm.keep_running() {
        let frame_index = rng.gen_range(0..bm.frame_count());
        let result = checkpoint_candidate(&bm, &mut write_buffer, frame_index);
        match result {
            Ok(()) | Err(OpError::Restart) => {}
            Err(OpError::Fatal(err)) => warn!(%err, "checkpointer pass failed"),
        }

        match write_buffer.submit_if_necessary(bm.disk(), batch, |frame, lsn| {
            complete_write(&bm, frame, lsn)
        }) {
            Ok(written) if written > 0 => {
                bm.stats()
                    .pages_written
                    .fetch_add(written as u64, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "checkpointer submit failed"),
        }

        std::thread::sleep(backoff);
    }

    if let Err(err) = write_buffer.flush(bm.disk(), |frame, lsn| complete_write(&bm, frame, lsn)) {
        warn!(%err, "checkpointer final flush failed");
    }
    debug!("checkpointer stopped");
}

fn checkpoint_candidate(
    bm: &BufferManager,
    write_buffer: &mut WriteBuffer,
    frame_index: usize,
) -> OpResult<()> {
    let frame = bm.frame(frame_index);
    let Some(mut guard) = frame.latch().try_optimistic() else {
        return Ok(());
    };

    // Cold frames belong to Phase B; writing them here would race its
    // is_wb bookkeeping.
    let candidate = frame.state() == FrameState::Hot && !frame.is_wb() && frame.is_dirty();
    guard.recheck()?;

    if candidate && !write_buffer.is_full() {
        let _exclusive = guard.try_upgrade()?;
        frame.set_wb(true);
        let pid = frame.pid();
        let lsn = frame.page().lsn();
        write_buffer.add(frame_index, pid, lsn, |dst| {
            bm.serialize_frame_into(frame_index, dst)
        });
        trace!(pid, frame = frame_index, "checkpoint staged dirty page");
    }
    Ok(())
}
