//! # Storage Module
//!
//! The storage layer owns everything below the allocator: the bytes of the
//! database (file or buffer), the 24-byte header, and the read-only views
//! readers translate refs through.
//!
//! ## Architecture Overview
//!
//! ```text
//!                  +--------------------+
//!   attach ------> |  attach::inspect   |  header, footer, size checks
//!                  +---------+----------+
//!                            |
//!                  +---------v----------+
//!   commit ------> |      Backing       |  File (pwrite + mmap) | Memory
//!                  +---------+----------+
//!                            | map_section
//!                  +---------v----------+
//!   readers <----- |   MappingManager   |  per-section mappings,
//!                  |  TranslationTable  |  retained until purged
//!                  +--------------------+
//! ```
//!
//! ## File Layout
//!
//! ```text
//! Offset 0:      FileHeader (24 bytes, two top-ref slots)
//! Offset 24:     arena data, refs are file offsets
//! ...
//! Offset N:      committed size, always a multiple of FILE_GRANULE
//! ```
//!
//! A ref below the committed size addresses committed, immutable bytes. The
//! allocator hands out refs above it for new data, and a commit writes those
//! slabs at exactly their ref offsets before publishing the new size.
//!
//! ## Module Organization
//!
//! - `backing`: file and in-memory backing stores
//! - `headers`: zerocopy header and streaming footer
//! - `attach`: validation of a store before it is mapped
//! - `mapping`: section mappings, translation tables, purge by version
//! - `cipher`: hook for encrypted pages

pub mod attach;
pub mod backing;
pub mod cipher;
pub mod headers;
pub mod mapping;

pub use attach::{inspect, upgrade_streaming_header, AttachMode, StoreInfo};
pub use backing::{Backing, OpenMode, StorageKind};
pub use cipher::{Encryption, EncryptionKey, PageCipher};
pub use headers::{FileHeader, StreamingFooter, CURRENT_FILE_FORMAT, FOOTER_MAGIC_COOKIE};
pub use mapping::{Mapping, MappingManager, MappingStats, TranslationTable};
