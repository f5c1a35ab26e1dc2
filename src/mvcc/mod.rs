//! # Multi-Version Concurrency Control (MVCC)
//!
//! This module implements snapshot isolation over the arena: many readers,
//! each pinned to an immutable committed version, and at most one writer
//! building the next version.
//!
//! ## Design Philosophy
//!
//! ### Versions Are File Prefixes
//!
//! A committed version is nothing more than `(version, top_ref, file_size)`.
//! Commits only append to the file and switch the header, so the bytes
//! `[0, file_size)` of a version never change afterwards. A reader needs no
//! copy and no undo log, only a guarantee that its mappings stay alive, which
//! the storage layer's retained mappings provide.
//!
//! ```text
//!  v5: [hdr|.....data5.....]
//!  v6: [hdr|.....data5.....|..data6..]
//!  v7: [hdr|.....data5.....|..data6..|....data7....]
//!         ^ header switched at each commit, nothing else rewritten
//! ```
//!
//! ### Single Writer
//!
//! Writers are serialized by `WriterLock` (in-process mutex + condvar, then
//! `flock` on `<db>.lock`). Readers never block writers and writers never
//! block readers.
//!
//! ## Transaction Lifecycle
//!
//! ```text
//!            begin_read              end_read
//!   Ready ─────────────> Reading ─────────────> Ready
//!     │                   │  ^ │
//!     │      promote      │  │ │ freeze
//!     │    ┌──────────────┘  │ v
//!     │    v       rollback  │ Frozen ──end_read──> Ready
//!     └─> Writing ───────────┘
//!  begin   │  commit_and_continue_as_read ──> Reading
//!  _write  └─ commit ──> Ready
//! ```
//!
//! ## Module Organization
//!
//! - `ring`: read-lock ring buffer with stable reader indices
//! - `control`: seqlock-published control block shared by processes
//! - `writer_lock`: in-process and interprocess writer exclusion
//! - `version_manager`: ties the three together, change notification

pub mod control;
pub mod ring;
pub mod version_manager;
pub mod writer_lock;

pub use control::{lock_file_path, ControlBlock};
pub use ring::{PublishedVersion, ReadLockInfo, ReadLockRing, RingStats};
pub use version_manager::{VersionAttach, VersionManager};
pub use writer_lock::WriterLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnStage {
    #[default]
    Ready,
    Reading,
    Writing,
    Frozen,
}

impl TxnStage {
    pub fn name(self) -> &'static str {
        match self {
            TxnStage::Ready => "ready",
            TxnStage::Reading => "reading",
            TxnStage::Writing => "writing",
            TxnStage::Frozen => "frozen",
        }
    }
}
