//! # Slab Allocator
//!
//! `SlabAlloc` owns the logical ref space of one write transaction:
//!
//! ```text
//!  0        baseline                    total_size
//!  |--------|---------------------------|
//!  committed, read-only    slabs (heap, writable)
//!  via TranslationTable    via binary search on ref_end
//! ```
//!
//! Refs below the baseline resolve through the translation table the
//! allocator was attached or rebased with. Refs at or above it resolve to a
//! slab. A commit writes the slabs at their own ref offsets in the file, up to
//! the end of the highest live allocation rounded to the file granule, and
//! then rebases the allocator onto that size:
//!
//! ```text
//!  baseline     highest live end   committed_size     total_size
//!  |--slab------------|.................|-------------------|
//!   written to the file                  never written, the next
//!                                        transaction's slab starts
//!                                        at committed_size again
//! ```
//!
//! The slab buffers are kept as spares for the next transaction.
//!
//! ## Free Space State
//!
//! ```text
//! Clean ──allocate/free──> Dirty ──reset/rebase──> Clean
//!   │                        │
//!   └──── corruption or failed growth ────> Invalid (sticky)
//! ```
//!
//! Once `Invalid`, every `allocate` and `free` fails with `InvalidFreeSpace`
//! until `reset_free_space_tracking` or `rebase` rebuilds the tracking.
//!
//! ## Freed Baseline Space
//!
//! Freeing a baseline ref only records it. Committed bytes may still be read
//! by older snapshots, so the space is never handed out again by this
//! allocator.

use std::collections::BTreeMap;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;

use super::freelist::FreeSpaceManager;
use super::slab::{acquire_buffer, place_slab, Slab};
use super::{Ref, NULL_REF};
use crate::config::{ALLOC_ALIGNMENT, FILE_GRANULE};
use crate::error::ArenaError;
use crate::storage::TranslationTable;

const SPARE_SLAB_LIMIT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreeSpaceState {
    #[default]
    Clean,
    Dirty,
    Invalid,
}

/// Which backing segment a ref falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefRange {
    Baseline,
    Slab(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorMetrics {
    pub baseline: u64,
    pub total_size: u64,
    pub slab_count: usize,
    pub slab_bytes: usize,
    pub allocated_bytes: usize,
    pub free_slab_bytes: usize,
    pub free_blocks: usize,
    pub freed_in_baseline_bytes: usize,
    pub allocations: u64,
    pub frees: u64,
    pub slab_grows: u64,
    pub state: FreeSpaceState,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    allocations: u64,
    frees: u64,
    slab_grows: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocOptions {
    pub section_shift: u32,
    /// Upper bound on total slab memory; `None` means unbounded.
    pub memory_limit: Option<usize>,
}

#[derive(Debug)]
pub struct SlabAlloc {
    options: AllocOptions,
    baseline: u64,
    table: Arc<TranslationTable>,
    slabs: Vec<Slab>,
    spare: Vec<Vec<u8>>,
    free_space: FreeSpaceManager,
    live: HashMap<Ref, usize>,
    allocated_bytes: usize,
    freed_in_baseline: BTreeMap<Ref, usize>,
    uncommitted_baseline_frees: Vec<Ref>,
    state: FreeSpaceState,
    counters: Counters,
}

#[inline]
fn round_to_alignment(size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(ALLOC_ALIGNMENT)
}

impl SlabAlloc {
    /// Attaches to the committed state `[0, baseline)` viewed through
    /// `table`.
    pub fn attach(table: Arc<TranslationTable>, baseline: u64, options: AllocOptions) -> Result<Self> {
        ensure!(
            baseline <= table.file_size(),
            "baseline {} exceeds mapped size {}",
            baseline,
            table.file_size()
        );
        Ok(Self {
            options,
            baseline,
            table,
            slabs: Vec::new(),
            spare: Vec::new(),
            free_space: FreeSpaceManager::new(),
            live: HashMap::new(),
            allocated_bytes: 0,
            freed_in_baseline: BTreeMap::new(),
            uncommitted_baseline_frees: Vec::new(),
            state: FreeSpaceState::Clean,
            counters: Counters::default(),
        })
    }

    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// End of the ref space: the end of the last slab, or the baseline.
    pub fn total_size(&self) -> u64 {
        self.slabs
            .last()
            .map(Slab::ref_end)
            .unwrap_or(self.baseline)
    }

    pub fn state(&self) -> FreeSpaceState {
        self.state
    }

    pub fn table(&self) -> &Arc<TranslationTable> {
        &self.table
    }

    pub fn is_dirty(&self) -> bool {
        !self.slabs.is_empty() || !self.freed_in_baseline.is_empty()
    }

    pub fn locate(&self, reference: Ref) -> Option<RefRange> {
        if reference < self.baseline {
            return Some(RefRange::Baseline);
        }
        let idx = self.slabs.partition_point(|s| s.ref_end() <= reference);
        match self.slabs.get(idx) {
            Some(slab) if slab.contains(reference) => Some(RefRange::Slab(idx)),
            _ => None,
        }
    }

    pub fn allocate(&mut self, size: usize) -> Result<Ref> {
        self.ensure_valid()?;
        let Some(size) = round_to_alignment(size) else {
            bail!(ArenaError::AllocationTooLarge {
                requested: size,
                section_size: 1usize << self.options.section_shift,
            });
        };

        let carved = match self.free_space.take(size) {
            Some(carved) => carved,
            None => {
                self.grow(size)?;
                match self.free_space.take(size) {
                    Some(carved) => carved,
                    None => {
                        self.state = FreeSpaceState::Invalid;
                        bail!(ArenaError::invalid_free_space(format!(
                            "no block of {} bytes after growing the arena",
                            size
                        )));
                    }
                }
            }
        };

        self.live.insert(carved.at, carved.size);
        self.allocated_bytes += carved.size;
        self.counters.allocations += 1;
        self.state = FreeSpaceState::Dirty;
        Ok(carved.at)
    }

    pub fn free(&mut self, reference: Ref, size: usize) -> Result<()> {
        self.ensure_valid()?;
        ensure!(
            reference != 0 && reference % ALLOC_ALIGNMENT as Ref == 0,
            ArenaError::InvalidRef { reference }
        );
        let Some(size) = round_to_alignment(size) else {
            bail!(ArenaError::InvalidRef { reference });
        };

        match self.locate(reference) {
            Some(RefRange::Baseline) => self.free_in_baseline(reference, size)?,
            Some(RefRange::Slab(slab)) => {
                let Some(block) = self.live.remove(&reference) else {
                    return Err(self.corrupt(format!(
                        "ref {} is not a live allocation (double free?)",
                        reference
                    )));
                };
                if size > block {
                    return Err(self.corrupt(format!(
                        "free of {} bytes at ref {} exceeds its block of {}",
                        size, reference, block
                    )));
                }
                if let Err(err) = self.free_space.release(reference, block, slab as u32) {
                    self.state = FreeSpaceState::Invalid;
                    return Err(err);
                }
                self.allocated_bytes -= block;
            }
            None => bail!(ArenaError::InvalidRef { reference }),
        }

        self.counters.frees += 1;
        self.state = FreeSpaceState::Dirty;
        Ok(())
    }

    fn free_in_baseline(&mut self, reference: Ref, size: usize) -> Result<()> {
        let end = match reference.checked_add(size as Ref) {
            Some(end) if end <= self.baseline => end,
            _ => bail!(ArenaError::InvalidRef { reference }),
        };
        if let Some((&at, &len)) = self.freed_in_baseline.range(..end).next_back() {
            if at + len as Ref > reference {
                return Err(self.corrupt(format!(
                    "baseline ref {} is already free",
                    reference
                )));
            }
        }
        self.freed_in_baseline.insert(reference, size);
        self.uncommitted_baseline_frees.push(reference);
        Ok(())
    }

    /// Bytes from `reference` to the end of its segment.
    pub fn translate(&self, reference: Ref) -> Result<&[u8]> {
        ensure!(reference != NULL_REF, ArenaError::InvalidRef { reference });
        match self.locate(reference) {
            Some(RefRange::Baseline) => {
                let bytes = self.table.translate(reference)?;
                let limit = (self.baseline - reference) as usize;
                Ok(&bytes[..bytes.len().min(limit)])
            }
            Some(RefRange::Slab(idx)) => {
                let slab = &self.slabs[idx];
                Ok(&slab.bytes()[(reference - slab.ref_start()) as usize..])
            }
            None => bail!(ArenaError::InvalidRef { reference }),
        }
    }

    /// Writable view of exactly one live allocation.
    pub fn translate_mut(&mut self, reference: Ref) -> Result<&mut [u8]> {
        match self.locate(reference) {
            Some(RefRange::Baseline) => bail!(ArenaError::ReadOnlyRef { reference }),
            Some(RefRange::Slab(idx)) => {
                let Some(&size) = self.live.get(&reference) else {
                    bail!(ArenaError::InvalidRef { reference });
                };
                let slab = &mut self.slabs[idx];
                let offset = (reference - slab.ref_start()) as usize;
                Ok(&mut slab.bytes_mut()[offset..offset + size])
            }
            None => bail!(ArenaError::InvalidRef { reference }),
        }
    }

    /// Forgets every slab allocation: all slab memory becomes free again.
    /// Freed baseline refs are kept.
    pub fn reset_free_space_tracking(&mut self) {
        self.free_space.clear();
        self.live.clear();
        self.allocated_bytes = 0;
        for (idx, slab) in self.slabs.iter().enumerate() {
            self.free_space.insert(slab.ref_start(), slab.len(), idx as u32);
        }
        self.state = FreeSpaceState::Clean;
    }

    /// Undoes everything since the last attach or rebase: slab allocations
    /// and baseline frees. Slab buffers stay for reuse.
    pub fn discard_uncommitted(&mut self) {
        for reference in self.uncommitted_baseline_frees.drain(..) {
            self.freed_in_baseline.remove(&reference);
        }
        self.reset_free_space_tracking();
    }

    /// Size the store has after committing this transaction: the end of the
    /// highest live slab allocation rounded up to the file granule, or the
    /// baseline when no slab allocation is live.
    pub fn committed_size(&self) -> u64 {
        let granule = FILE_GRANULE as u64;
        self.live
            .iter()
            .map(|(&at, &size)| at + size as Ref)
            .max()
            .map_or(self.baseline, |end| {
                end.next_multiple_of(granule).max(self.baseline)
            })
    }

    /// Slab bytes below `end` as `(ref_start, bytes)` in ref order, for
    /// writing at commit.
    pub fn slabs_below(&self, end: Ref) -> impl Iterator<Item = (Ref, &[u8])> + '_ {
        self.slabs
            .iter()
            .take_while(move |s| s.ref_start() < end)
            .map(move |s| {
                let len = (s.ref_end().min(end) - s.ref_start()) as usize;
                (s.ref_start(), &s.bytes()[..len])
            })
    }

    /// Moves onto a new committed state. Slab buffers become spares; slab
    /// space nothing was committed into is forgotten.
    pub fn rebase(&mut self, table: Arc<TranslationTable>, baseline: u64) -> Result<()> {
        ensure!(
            baseline <= table.file_size(),
            "baseline {} exceeds mapped size {}",
            baseline,
            table.file_size()
        );

        // Anything but our own commit means another writer moved the state
        // on, and our baseline frees no longer describe it.
        if baseline != self.committed_size() {
            self.freed_in_baseline.clear();
        }
        self.uncommitted_baseline_frees.clear();

        for slab in self.slabs.drain(..) {
            if self.spare.len() < SPARE_SLAB_LIMIT {
                self.spare.push(slab.into_buffer());
            }
        }

        self.free_space.clear();
        self.live.clear();
        self.allocated_bytes = 0;
        self.state = FreeSpaceState::Clean;
        self.table = table;
        self.baseline = baseline;
        Ok(())
    }

    /// Releases every slab and spare buffer.
    pub fn detach(&mut self) {
        self.slabs.clear();
        self.spare.clear();
        self.free_space.clear();
        self.live.clear();
        self.allocated_bytes = 0;
        self.state = FreeSpaceState::Clean;
    }

    pub fn metrics(&self) -> AllocatorMetrics {
        AllocatorMetrics {
            baseline: self.baseline,
            total_size: self.total_size(),
            slab_count: self.slabs.len(),
            slab_bytes: self.slab_bytes(),
            allocated_bytes: self.allocated_bytes,
            free_slab_bytes: self.free_space.free_bytes(),
            free_blocks: self.free_space.block_count(),
            freed_in_baseline_bytes: self.freed_in_baseline.values().sum(),
            allocations: self.counters.allocations,
            frees: self.counters.frees,
            slab_grows: self.counters.slab_grows,
            state: self.state,
        }
    }

    /// Free slab blocks as `(ref, size)` in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (Ref, usize)> + '_ {
        self.free_space.blocks()
    }

    fn slab_bytes(&self) -> usize {
        self.slabs.iter().map(Slab::len).sum()
    }

    fn grow(&mut self, size: usize) -> Result<()> {
        let previous = self.slabs.last().map(Slab::len).unwrap_or(0);
        let placement = place_slab(self.total_size(), size, previous, self.options.section_shift)?;

        if let Some(limit) = self.options.memory_limit {
            if self.slab_bytes() + placement.size > limit {
                self.state = FreeSpaceState::Invalid;
                tracing::warn!(
                    requested = placement.size,
                    limit,
                    "arena growth exceeds memory limit"
                );
                bail!(ArenaError::OutOfMemory {
                    requested: placement.size
                });
            }
        }

        let mem = match acquire_buffer(&mut self.spare, placement.size) {
            Ok(mem) => mem,
            Err(err) => {
                self.state = FreeSpaceState::Invalid;
                return Err(err);
            }
        };

        let idx = self.slabs.len() as u32;
        self.slabs.push(Slab::new(placement.ref_start, mem));
        self.free_space.insert(placement.ref_start, placement.size, idx);
        self.counters.slab_grows += 1;

        tracing::debug!(
            ref_start = placement.ref_start,
            size = placement.size,
            slabs = self.slabs.len(),
            "grew arena by one slab"
        );
        Ok(())
    }

    fn ensure_valid(&self) -> Result<()> {
        ensure!(
            self.state != FreeSpaceState::Invalid,
            ArenaError::invalid_free_space("free-space tracking must be rebuilt before reuse")
        );
        Ok(())
    }

    fn corrupt(&mut self, reason: String) -> eyre::Report {
        self.state = FreeSpaceState::Invalid;
        eyre::Report::new(ArenaError::invalid_free_space(reason))
    }
}
