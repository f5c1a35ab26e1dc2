//! Slabs: heap buffers that back refs past the committed size.

use eyre::{bail, Result};

use super::Ref;
use crate::config::{FILE_GRANULE, MAX_SLAB_SIZE, MIN_SLAB_SIZE};
use crate::error::ArenaError;

#[derive(Debug)]
pub struct Slab {
    ref_start: Ref,
    mem: Vec<u8>,
}

impl Slab {
    pub fn new(ref_start: Ref, mem: Vec<u8>) -> Self {
        Self { ref_start, mem }
    }

    pub fn ref_start(&self) -> Ref {
        self.ref_start
    }

    pub fn ref_end(&self) -> Ref {
        self.ref_start + self.mem.len() as Ref
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn contains(&self, reference: Ref) -> bool {
        reference >= self.ref_start && reference < self.ref_end()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mem
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.mem
    }
}

/// Where a new slab goes and how big it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabPlacement {
    pub ref_start: Ref,
    pub size: usize,
}

/// Places the next slab after `total_size` for a `request` byte allocation.
///
/// The slab is `max(request, MIN_SLAB_SIZE, 2 * previous)` rounded up to the
/// granule and clipped to the end of its section. When the rest of the
/// current section cannot hold `request`, the slab starts at the next section
/// boundary and the tail of the current section is never used.
pub fn place_slab(
    total_size: u64,
    request: usize,
    previous_slab: usize,
    section_shift: u32,
) -> Result<SlabPlacement> {
    let section_size = 1u64 << section_shift;
    let granule = FILE_GRANULE as u64;
    let Some(needed) = (request as u64)
        .checked_next_multiple_of(granule)
        .filter(|&needed| needed <= section_size)
    else {
        bail!(ArenaError::AllocationTooLarge {
            requested: request,
            section_size: section_size as usize,
        });
    };

    let mut ref_start = total_size.next_multiple_of(granule);
    let mut section_end = ((ref_start >> section_shift) + 1) << section_shift;
    if section_end - ref_start < needed {
        ref_start = section_end;
        section_end += section_size;
    }

    let doubled = (previous_slab.saturating_mul(2)).min(MAX_SLAB_SIZE) as u64;
    let wanted = needed.max(MIN_SLAB_SIZE as u64).max(doubled);
    let size = wanted.min(section_end - ref_start);

    Ok(SlabPlacement {
        ref_start,
        size: size as usize,
    })
}

/// Zeroed buffer of `size` bytes, reusing a spare buffer when one is large
/// enough. Reports allocation failure instead of aborting.
pub fn acquire_buffer(spare: &mut Vec<Vec<u8>>, size: usize) -> Result<Vec<u8>> {
    if let Some(pos) = spare.iter().position(|b| b.capacity() >= size) {
        let mut buf = spare.swap_remove(pos);
        buf.clear();
        buf.resize(size, 0);
        return Ok(buf);
    }

    let mut buf = Vec::new();
    if buf.try_reserve_exact(size).is_err() {
        bail!(ArenaError::OutOfMemory { requested: size });
    }
    buf.resize(size, 0);
    Ok(buf)
}
