//! # TundraDB - Buffer-Managed Embedded Storage Engine
//!
//! TundraDB is an embedded single-node storage engine for key/value
//! workloads whose working sets exceed DRAM. It is linked into a host
//! process as a library; there is no server, no SQL, and no background
//! process outside the host.
//!
//! The engine is two tightly coupled subsystems:
//!
//! - **Buffer manager**: a fixed pool of 4 KiB frames backed by a raw file
//!   or block device. Pages move through a hot / cooling / evicted
//!   lifecycle driven by a background page provider, and in-memory page
//!   references are *swips* - tagged words that hold either a direct frame
//!   reference or an on-storage page id.
//! - **Optimistic B+tree**: a concurrent, lock-coupled tree whose nodes are
//!   buffer-managed pages. Readers validate latch versions instead of
//!   acquiring locks, and every conflict funnels into a single restart loop
//!   per operation.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tundradb::{BTree, Engine, EngineConfig};
//!
//! let engine = Engine::start(
//!     EngineConfig::new("./store.db")
//!         .dram_pages(1024)
//!         .ssd_pages(65536),
//! )?;
//!
//! let tree = BTree::create(&engine, 1)?;
//! tree.insert(42, 1000)?;
//! assert_eq!(tree.lookup(42)?, Some(1000));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        Host process (library)        │
//! ├──────────────────────────────────────┤
//! │      Optimistic B+Tree (btree)       │
//! ├──────────────────────────────────────┤
//! │  Buffer Manager (buffer)             │
//! │   frames · swips · cooling FIFO      │
//! │   page provider · write buffer       │
//! ├──────────────────────────────────────┤
//! │  Versioned latches (sync)            │
//! ├──────────────────────────────────────┤
//! │  Pages + positional file I/O         │
//! │  (storage)                           │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## What the Engine Does Not Do
//!
//! No write-ahead log or crash recovery of uncommitted work, no
//! transactions, no secondary indexes or scans, no replication. Writeback
//! exists to reclaim frames, not to provide durability guarantees beyond
//! page-level consistency.
//!
//! ## Module Overview
//!
//! - [`storage`]: page layout and the backing file
//! - [`sync`]: versioned latches and the restart signal
//! - [`buffer`]: frames, swips, the buffer manager, and its background tasks
//! - [`btree`]: the optimistic B+tree
//! - [`config`]: engine configuration
//! - [`engine`]: the top-level handle

pub mod btree;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod storage;
pub mod sync;

pub use btree::BTree;
pub use buffer::{BufferManager, BufferStatsSnapshot, Swip};
pub use config::EngineConfig;
pub use engine::Engine;
pub use storage::{Page, PAGE_SIZE};
