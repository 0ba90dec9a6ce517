//! # End-to-End Engine Scenarios
//!
//! Exercises the full stack - optimistic B+tree over the buffer manager with
//! the page provider running - through the behaviors the engine promises:
//!
//! 1. **Round-trip**: what goes in comes out, absent keys stay absent.
//! 2. **Overwrite**: duplicate-key insert replaces the payload.
//! 3. **Eviction transparency**: with DRAM far smaller than the key set,
//!    every key remains retrievable while the provider keeps frames free.
//! 4. **Concurrency**: one writer and many readers make progress with no
//!    deadlocks and no lost keys.
//! 5. **Split stress**: tightly clamped node capacities keep the tree
//!    height logarithmic under 100k random inserts.
//! 6. **Restart fairness**: a key whose leaf is constantly demoted and
//!    promoted still completes lookups at a steady rate.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tundradb::{BTree, Engine, EngineConfig};

fn start_engine(dram: u32, ssd: u32, threshold: u32) -> (tempfile::TempDir, Engine) {
    let dir = tempdir().unwrap();
    let config = EngineConfig::new(dir.path().join("scenario.db"))
        .dram_pages(dram)
        .ssd_pages(ssd)
        .cooling_threshold(threshold);
    let engine = Engine::start(config).unwrap();
    (dir, engine)
}

#[test]
fn minimal_round_trip() {
    let (_dir, engine) = start_engine(16, 64, 90);
    let tree = BTree::create(&engine, 1).unwrap();

    tree.insert(1, 0xA).unwrap();

    assert_eq!(tree.lookup(1).unwrap(), Some(0xA));
    assert_eq!(tree.lookup(2).unwrap(), None);
}

#[test]
fn overwrite_replaces_payload() {
    let (_dir, engine) = start_engine(16, 64, 90);
    let tree = BTree::create(&engine, 1).unwrap();

    for i in 0..10u64 {
        tree.insert(i, i).unwrap();
    }
    tree.insert(5, 999).unwrap();

    assert_eq!(tree.lookup(5).unwrap(), Some(999));
    assert_eq!(tree.lookup(4).unwrap(), Some(4));
}

#[test]
fn forced_eviction_keeps_keys_retrievable() {
    let (_dir, engine) = start_engine(4, 1024, 50);
    let tree = BTree::create(&engine, 1).unwrap();

    for i in 0..500u64 {
        tree.insert(i, i * 3).unwrap();
    }

    // Within a second of quiescence the provider must restore the free
    // watermark.
    let deadline = Instant::now() + Duration::from_secs(1);
    while engine.free_frame_count() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(
        engine.free_frame_count() >= 2,
        "free frames stuck at {}",
        engine.free_frame_count()
    );

    for i in 0..500u64 {
        assert_eq!(tree.lookup(i).unwrap(), Some(i * 3), "key {} lost", i);
    }

    let stats = engine.stats();
    assert!(stats.unswizzled_pages > 0, "eviction never ran");
    assert!(stats.pages_written > 0, "dirty pages never written back");
}

#[test]
fn concurrent_readers_and_writer_make_progress() {
    const KEYS: u64 = 10_000;
    const READERS: usize = 8;
    const LOOKUPS_PER_READER: usize = 20_000;

    let (_dir, engine) = start_engine(256, 4096, 90);
    let tree = Arc::new(BTree::create(&engine, 1).unwrap());

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for i in 0..KEYS {
                tree.insert(i, i + 1).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..READERS)
        .map(|reader| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let span = KEYS / READERS as u64;
                let base = reader as u64 * span;
                let mut seed = 0x9E37_79B9_7F4A_7C15u64.wrapping_add(reader as u64);
                for _ in 0..LOOKUPS_PER_READER {
                    // xorshift over the reader's subrange
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    let key = base + seed % span;
                    // The key may not be inserted yet; both outcomes are
                    // legal mid-run.
                    let found = tree.lookup(key).unwrap();
                    if let Some(value) = found {
                        assert_eq!(value, key + 1);
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    for i in 0..KEYS {
        assert_eq!(tree.lookup(i).unwrap(), Some(i + 1), "key {} lost", i);
    }
}

#[test]
fn split_stress_keeps_height_logarithmic() {
    const KEYS: usize = 100_000;
    const CAPACITY: usize = 32;

    // A gentle watermark: this scenario stresses splits, not eviction churn.
    let (_dir, engine) = start_engine(8192, 16384, 20);
    let tree = BTree::create_with_capacities(&engine, 1, CAPACITY, CAPACITY).unwrap();

    // Deterministic pseudo-random 64-bit keys.
    let mut seed = 0xDEAD_BEEF_CAFE_F00Du64;
    let mut keys = Vec::with_capacity(KEYS);
    for _ in 0..KEYS {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        keys.push(seed);
    }

    for &key in &keys {
        tree.insert(key, key ^ 0x5555).unwrap();
    }

    let bound = ((KEYS as f64).log(CAPACITY as f64)).ceil() as usize + 1;
    let height = tree.height().unwrap();
    assert!(height <= bound, "height {} exceeds bound {}", height, bound);

    for &key in &keys {
        assert_eq!(tree.lookup(key).unwrap(), Some(key ^ 0x5555));
    }
}

#[test]
fn lookups_progress_under_constant_demotion() {
    let (_dir, engine) = start_engine(8, 256, 90);
    let tree = BTree::create(&engine, 1).unwrap();

    // A handful of leaves so the provider constantly demotes the working
    // set out from under the reader.
    for i in 0..600u64 {
        tree.insert(i, i * 3).unwrap();
    }

    let run = Duration::from_secs(1);
    let start = Instant::now();
    let mut last = start;
    let mut max_gap = Duration::ZERO;
    let mut completions = 0u64;

    while start.elapsed() < run {
        assert_eq!(tree.lookup(123).unwrap(), Some(369));
        let now = Instant::now();
        max_gap = max_gap.max(now - last);
        last = now;
        completions += 1;
    }

    assert!(
        completions >= 50,
        "only {} lookups completed in {:?}",
        completions,
        run
    );
    assert!(
        max_gap <= Duration::from_millis(250),
        "lookup stalled for {:?}",
        max_gap
    );

    // The churn this scenario is about actually happened.
    let stats = engine.stats();
    assert!(stats.unswizzled_pages > 0);
    assert!(stats.swizzled_pages > 0);
}

#[test]
fn stop_is_clean_after_heavy_churn() {
    let (_dir, mut engine) = {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new(dir.path().join("scenario.db"))
            .dram_pages(8)
            .ssd_pages(512)
            .cooling_threshold(90);
        let engine = Engine::start(config).unwrap();
        (dir, engine)
    };
    let tree = BTree::create(&engine, 1).unwrap();

    for i in 0..2000u64 {
        tree.insert(i, i).unwrap();
    }

    engine.stop().unwrap();
    engine.stop().unwrap();
}
