//! # pmlsm
//!
//! A persistent-memory LSM key-value engine with:
//! - Per-client write-ahead logs in segment-allocated persistent memory
//! - Two memtables swapped by epoch, flushed into L0 trees
//! - Persistent sorted tables (PSTs) built from index and data blocks
//! - A single key-disjoint L1 run maintained by compaction
//! - Manifest-backed crash recovery
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                DbClient (one per thread)                     │
//! │          put / delete / get / scan                           │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │ write                            │ read
//!            ▼                                  ▼
//!   ┌─────────────────┐   epoch swap   ┌─────────────────┐
//!   │  Log (group e%2)│ ─────────────► │ Memtable (e%2)  │
//!   └────────┬────────┘                └────────┬────────┘
//!            │ retire                           │ FlushJob
//!            ▼                                  ▼
//!   ┌─────────────────┐                ┌─────────────────┐
//!   │ SegmentAllocator│ ◄───────────── │  L0 trees (ring)│
//!   │ (bitmaps, pool) │   pages        └────────┬────────┘
//!   └─────────────────┘                         │ CompactionJob
//!            ▲                                  ▼
//!            │                         ┌─────────────────┐
//!            └──────────────────────── │   L1 (disjoint) │
//!                                      └────────┬────────┘
//!                                               │
//!                                      ┌────────▼────────┐
//!                                      │    Manifest     │
//!                                      └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod storage;
pub mod memtable;
pub mod wal;
pub mod lsm;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LsmError, Result};
pub use config::{Config, DataMedium, ValueStrategyKind};
pub use engine::{Db, DbClient, DbStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of pmlsm
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
