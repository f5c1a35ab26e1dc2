//! # Arena Allocator
//!
//! This module maps refs, 64-bit offsets into one logical address space,
//! onto memory. The space is split at the baseline:
//!
//! ```text
//! [0 .. baseline)            committed bytes of the store, read-only
//! [baseline .. total_size)   slabs owned by the current write transaction
//! ```
//!
//! Every ref is a multiple of `ALLOC_ALIGNMENT`, and ref 0 is null and never
//! handed out. Refs are file offsets, so a ref stays valid across commits:
//! committing writes each slab at the offsets its refs already name.
//!
//! ## Module Organization
//!
//! - `slab_alloc`: [`SlabAlloc`], allocate/free/translate and commit rebasing
//! - `slab`: slab buffers and growth placement
//! - `freelist`: the size-bucketed [`FreeSpaceManager`]

pub mod freelist;
pub mod slab;
pub mod slab_alloc;

pub use freelist::FreeSpaceManager;
pub use slab_alloc::{AllocOptions, AllocatorMetrics, FreeSpaceState, RefRange, SlabAlloc};

/// Offset into the logical address space. 0 is null.
pub type Ref = u64;

pub const NULL_REF: Ref = 0;
