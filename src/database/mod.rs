//! # Database Module
//!
//! This module ties the storage layer, the slab allocator and the version
//! manager together behind the public `Database` / `Transaction` API.
//!
//! ## Architecture
//!
//! ```text
//!   Database (Arc<SharedDatabase>, cloneable)
//!     │
//!     ├── Backing          file or buffer, header, pwrite/sync
//!     ├── MappingManager   reader views, retained mappings
//!     ├── VersionManager   control block, read-lock ring, writer lock
//!     ├── SlabAlloc        parked between write transactions
//!     └── Replication      commit hooks
//! ```
//!
//! ## Transaction Lifecycle
//!
//! ```text
//!              begin_read                  begin_write
//!                  │                            │
//!                  ▼        promote_to_write    ▼
//!   Ready ◄── Reading ─────────────────────► Writing
//!     ▲          │  ▲                         │   │
//!     │ end_read │  └─── rollback / failed ───┘   │ commit
//!     │          │       commit                   │
//!     │          ▼ freeze                         │
//!     │       Frozen (new handle)                 │
//!     └───────────────────────────────────────────┘
//! ```
//!
//! `commit_and_continue_as_read` goes from Writing straight to Reading on the
//! version it just created.
//!
//! ## Thread Safety
//!
//! `Database` is `Send + Sync`. Any number of read transactions run in
//! parallel with at most one write transaction per file, across every
//! process attached to it.

mod builder;
mod config;
#[allow(clippy::module_inception)]
mod database;
mod transaction;

pub use builder::DatabaseBuilder;
pub use config::Config;
pub use database::{Database, DatabaseMetrics};
pub use transaction::Transaction;
