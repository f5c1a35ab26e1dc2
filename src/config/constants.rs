//! # arenadb Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! ALLOC_ALIGNMENT (8 bytes)
//!       │
//!       ├─> MIN_SPLIT_REMAINDER (multiple of, >= 2 * alignment)
//!       │     Free remainders below this are handed out with the block
//!       │
//!       └─> FILE_HEADER_SIZE (24 bytes, multiple of alignment)
//!             The first valid ref is FILE_HEADER_SIZE
//!
//! FILE_GRANULE (4096 bytes)
//!       │
//!       ├─> INITIAL_FILE_SIZE (one granule)
//!       │
//!       ├─> MIN_SLAB_SIZE (multiple of granule)
//!       │     Slab ranges start and end on granule boundaries so the file
//!       │     size after a commit is always granule aligned
//!       │
//!       └─> MIN_SECTION_SHIFT (sections are multiples of the granule and of
//!             the 64KB mapping offset granularity on every platform)
//!
//! DEFAULT_SECTION_SHIFT (26 => 64MB sections)
//!       │
//!       └─> MAX_SLAB_SIZE (<= one section)
//!
//! INITIAL_RING_CAPACITY (32 read-lock entries)
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `ALLOC_ALIGNMENT` is a power of two
//! 2. `FILE_HEADER_SIZE % ALLOC_ALIGNMENT == 0`
//! 3. `MIN_SLAB_SIZE % FILE_GRANULE == 0`
//! 4. `(1 << MIN_SECTION_SHIFT) % FILE_GRANULE == 0`
//!
//! Slabs are clipped to the end of their section at runtime, so
//! `MAX_SLAB_SIZE` only caps the doubling and may exceed a small section.

// ============================================================================
// ALLOCATION GRANULARITY
// ============================================================================

/// Every ref and every block size is a multiple of this.
pub const ALLOC_ALIGNMENT: usize = 8;

/// A split remainder smaller than this stays attached to the allocated block.
pub const MIN_SPLIT_REMAINDER: usize = 16;

const _: () = assert!(ALLOC_ALIGNMENT.is_power_of_two());
const _: () = assert!(MIN_SPLIT_REMAINDER % ALLOC_ALIGNMENT == 0);
const _: () = assert!(MIN_SPLIT_REMAINDER >= 2 * ALLOC_ALIGNMENT);

// ============================================================================
// FILE LAYOUT
// ============================================================================

/// Size of the fixed file header (two top refs, mnemonic, format, flags).
pub const FILE_HEADER_SIZE: usize = 24;

/// Size of the trailing footer of a streaming-form file.
pub const STREAMING_FOOTER_SIZE: usize = 16;

/// Committed file sizes are always a multiple of this.
pub const FILE_GRANULE: usize = 4096;

/// Size of a freshly created database file.
pub const INITIAL_FILE_SIZE: usize = FILE_GRANULE;

const _: () = assert!(FILE_HEADER_SIZE % ALLOC_ALIGNMENT == 0);
const _: () = assert!(INITIAL_FILE_SIZE % FILE_GRANULE == 0);
const _: () = assert!(FILE_HEADER_SIZE + STREAMING_FOOTER_SIZE <= FILE_GRANULE);

// ============================================================================
// SECTIONS
// No allocation, slab or mapping crosses a section boundary
// ============================================================================

/// Default section size is 64MB.
pub const DEFAULT_SECTION_SHIFT: u32 = 26;

/// Smallest supported section (64KB). Mapping offsets must be multiples of
/// the platform allocation granularity, which is 64KB on Windows.
pub const MIN_SECTION_SHIFT: u32 = 16;

/// Largest supported section (1GB).
pub const MAX_SECTION_SHIFT: u32 = 30;

const _: () = assert!((1usize << MIN_SECTION_SHIFT) % FILE_GRANULE == 0);
const _: () = assert!(MIN_SECTION_SHIFT <= DEFAULT_SECTION_SHIFT);
const _: () = assert!(DEFAULT_SECTION_SHIFT <= MAX_SECTION_SHIFT);

// ============================================================================
// SLAB GROWTH
// ============================================================================

/// Smallest slab the allocator creates (128KB).
pub const MIN_SLAB_SIZE: usize = 128 * 1024;

/// Slab sizes double until they reach this cap (16MB).
pub const MAX_SLAB_SIZE: usize = 16 * 1024 * 1024;

const _: () = assert!(MIN_SLAB_SIZE % FILE_GRANULE == 0);
const _: () = assert!(MAX_SLAB_SIZE % FILE_GRANULE == 0);
const _: () = assert!(MIN_SLAB_SIZE <= MAX_SLAB_SIZE);

// ============================================================================
// VERSION MANAGEMENT
// ============================================================================

/// Number of read-lock entries in a fresh ring buffer.
pub const INITIAL_RING_CAPACITY: usize = 32;

/// The version number assigned to the state found at first attach.
pub const INITIAL_VERSION: u64 = 1;

/// Upper bound on one wait inside `wait_for_change` when the control block
/// cannot be blocked on (read-only attaches, platforms without futexes).
pub const CHANGE_POLL_INTERVAL_MS: u64 = 50;

const _: () = assert!(INITIAL_RING_CAPACITY >= 2);

// ============================================================================
// ENCRYPTION
// ============================================================================

/// Length of the optional encryption key.
pub const ENCRYPTION_KEY_SIZE: usize = 32;
