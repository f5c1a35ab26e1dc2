//! # arenadb - Slab Arena and MVCC Versions for an Embedded Store
//!
//! arenadb is the memory layer of an embedded transactional storage engine.
//! Every piece of persistent data lives in one address space of *refs*:
//! 8-byte aligned offsets into the database file. Readers see an immutable
//! committed snapshot through memory mappings; a single writer builds the
//! next snapshot in private slabs and commits it with an append-only write
//! and a double-buffered header flip.
//!
//! ## Quick Start
//!
//! ```ignore
//! use arenadb::Database;
//!
//! let db = Database::open("./data.arena")?;
//!
//! let mut txn = db.begin_write(false)?.expect("blocking begin");
//! let r = txn.allocate(16)?;
//! txn.translate_mut(r)?[..5].copy_from_slice(b"hello");
//! txn.set_top_ref(r)?;
//! let version = txn.commit()?;
//!
//! let reader = db.begin_read(Some(version))?;
//! assert_eq!(&reader.translate(reader.top_ref())?[..5], b"hello");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │    Public API (Database/Transaction)│
//! ├──────────────────┬──────────────────┤
//! │  SlabAlloc       │  VersionManager  │
//! │  free lists,     │  read-lock ring, │
//! │  slabs           │  control block,  │
//! │                  │  writer lock     │
//! ├──────────────────┴──────────────────┤
//! │  MappingManager (translation tables)│
//! ├─────────────────────────────────────┤
//! │  Backing (file + mmap | buffer)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! data.arena          # 24-byte header, then arena data addressed by ref
//! data.arena.lock     # 64-byte shared control block, writer flock
//! ```
//!
//! ## Module Overview
//!
//! - [`alloc`]: slab allocator and free-space tracking
//! - [`mvcc`]: version ring, control block, writer lock
//! - [`storage`]: backing stores, header format, mappings
//! - [`database`]: `Database`, `Transaction`, builder and config
//! - [`replication`]: commit hooks
//! - [`config`]: numeric constants
//! - [`error`]: error taxonomy

pub mod alloc;
pub mod config;
pub mod database;
pub mod error;
pub mod mvcc;
pub mod replication;
pub mod storage;

pub use alloc::{Ref, NULL_REF};
pub use database::{Config, Database, DatabaseBuilder, DatabaseMetrics, Transaction};
pub use error::{ArenaError, ErrorKind};
pub use mvcc::TxnStage;
pub use replication::{NoReplication, Replication};
pub use storage::{EncryptionKey, PageCipher, StorageKind};
