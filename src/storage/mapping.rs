//! # Section Mappings and Ref Translation
//!
//! The committed prefix of the backing store is viewed through one mapping
//! per section. A section is `1 << section_shift` bytes; no allocation or slab
//! ever crosses a section boundary, so a ref resolves with one shift and one
//! index:
//!
//! ```text
//! ref ──> section = ref >> shift ──> sections[section].bytes()[ref - start..]
//! ```
//!
//! ## Never Remap In Place
//!
//! When the file grows, full sections keep their mappings. A partial last
//! section that grew gets a NEW mapping; the old one moves to a retained list.
//! A [`TranslationTable`] is immutable and holds an `Arc` to each of its
//! mappings, and every reader holds an `Arc` to the table it started with, so
//! memory a reader was given can never be unmapped underneath it.
//!
//! ```text
//! v5 table: [S0 full][S1 partial(64K)]
//! v6 table: [S0 full][S1 partial(192K)]   S1(64K) retained, tag = youngest live
//! v7 table: [S0 full][S1 full][S2 ...]    S1(192K) retained
//! ```
//!
//! ## Purging
//!
//! Retained mappings and tables are tagged with the youngest live version
//! recorded by the previous purge. `purge_old_mappings(oldest, youngest)`
//! drops every entry tagged below `oldest`, then remembers `youngest` as the
//! tag for the next replacement. A reader still holding a purged table keeps
//! it alive through its own `Arc`; purging only drops the manager's handles.

use std::sync::Arc;

use eyre::{ensure, Result};
use memmap2::Mmap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::backing::Backing;
use crate::alloc::Ref;
use crate::error::ArenaError;

#[derive(Debug)]
enum MappingKind {
    Mapped(Mmap),
    Owned(Box<[u8]>),
}

/// Read-only view of `[start, start + len)` of the backing store.
#[derive(Debug)]
pub struct Mapping {
    start: u64,
    kind: MappingKind,
}

impl Mapping {
    pub(crate) fn mapped(start: u64, mmap: Mmap) -> Self {
        Self {
            start,
            kind: MappingKind::Mapped(mmap),
        }
    }

    pub(crate) fn owned(start: u64, bytes: Box<[u8]>) -> Self {
        Self {
            start,
            kind: MappingKind::Owned(bytes),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.kind {
            MappingKind::Mapped(mmap) => mmap,
            MappingKind::Owned(bytes) => bytes,
        }
    }

    fn end(&self) -> u64 {
        self.start + self.len() as u64
    }
}

/// Immutable ref-to-memory lookup over `[0, file_size)`.
#[derive(Debug)]
pub struct TranslationTable {
    file_size: u64,
    section_shift: u32,
    sections: Vec<Arc<Mapping>>,
}

impl TranslationTable {
    fn empty(section_shift: u32) -> Self {
        Self {
            file_size: 0,
            section_shift,
            sections: Vec::new(),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Bytes from `reference` to the end of its section mapping.
    pub fn translate(&self, reference: Ref) -> Result<&[u8]> {
        ensure!(
            reference < self.file_size,
            ArenaError::InvalidRef { reference }
        );
        let mapping = &self.sections[(reference >> self.section_shift) as usize];
        let offset = (reference - mapping.start()) as usize;
        Ok(&mapping.bytes()[offset..])
    }

    fn mapping(&self, index: usize) -> Option<&Arc<Mapping>> {
        self.sections.get(index)
    }
}

#[derive(Debug)]
struct Retained<T> {
    replaced_at_version: u64,
    /// Never read; keeps the superseded object alive until purged.
    _held: Arc<T>,
}

#[derive(Debug)]
struct MappingState {
    current: Arc<TranslationTable>,
    old_mappings: Vec<Retained<Mapping>>,
    old_tables: Vec<Retained<TranslationTable>>,
    youngest_live_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MappingStats {
    pub live_sections: usize,
    pub retained_mappings: usize,
    pub retained_tables: usize,
    pub mapped_bytes: u64,
}

#[derive(Debug)]
pub struct MappingManager {
    section_shift: u32,
    state: Mutex<MappingState>,
}

impl MappingManager {
    pub fn new(section_shift: u32, initial_version: u64) -> Self {
        Self {
            section_shift,
            state: Mutex::new(MappingState {
                current: Arc::new(TranslationTable::empty(section_shift)),
                old_mappings: Vec::new(),
                old_tables: Vec::new(),
                youngest_live_version: initial_version,
            }),
        }
    }

    pub fn section_shift(&self) -> u32 {
        self.section_shift
    }

    pub fn section_size(&self) -> u64 {
        1u64 << self.section_shift
    }

    pub fn current(&self) -> Arc<TranslationTable> {
        Arc::clone(&self.state.lock().current)
    }

    /// Extends the view to cover `[0, new_file_size)` and returns the table
    /// that does. A smaller size than the current view returns the current
    /// table unchanged.
    pub fn update_reader_view(
        &self,
        backing: &Backing,
        new_file_size: u64,
    ) -> Result<Arc<TranslationTable>> {
        let mut state = self.state.lock();
        if new_file_size <= state.current.file_size {
            return Ok(Arc::clone(&state.current));
        }

        let section_size = self.section_size();
        let section_count = new_file_size.div_ceil(section_size) as usize;
        let tag = state.youngest_live_version;

        let mut sections = Vec::with_capacity(section_count);
        let mut replaced: SmallVec<[Arc<Mapping>; 2]> = SmallVec::new();

        for index in 0..section_count {
            let start = index as u64 * section_size;
            let end = (start + section_size).min(new_file_size);

            match state.current.mapping(index) {
                Some(existing) if existing.end() == end => {
                    sections.push(Arc::clone(existing));
                }
                existing => {
                    if let Some(old) = existing {
                        replaced.push(Arc::clone(old));
                    }
                    let mapping = backing.map_section(start, (end - start) as usize)?;
                    sections.push(Arc::new(mapping));
                }
            }
        }

        let table = Arc::new(TranslationTable {
            file_size: new_file_size,
            section_shift: self.section_shift,
            sections,
        });

        tracing::debug!(
            old_size = state.current.file_size,
            new_size = new_file_size,
            replaced = replaced.len(),
            tag,
            "extended reader view"
        );

        let previous = std::mem::replace(&mut state.current, Arc::clone(&table));
        if previous.file_size > 0 {
            state.old_tables.push(Retained {
                replaced_at_version: tag,
                _held: previous,
            });
        }
        state
            .old_mappings
            .extend(replaced.into_iter().map(|mapping| Retained {
                replaced_at_version: tag,
                _held: mapping,
            }));

        Ok(table)
    }

    /// Drops retained mappings and tables tagged below `oldest_live_version`.
    /// Returns how many entries were released.
    pub fn purge_old_mappings(&self, oldest_live_version: u64, youngest_live_version: u64) -> usize {
        let mut state = self.state.lock();

        let before = state.old_mappings.len() + state.old_tables.len();
        state
            .old_mappings
            .retain(|m| m.replaced_at_version >= oldest_live_version);
        state
            .old_tables
            .retain(|t| t.replaced_at_version >= oldest_live_version);
        state.youngest_live_version = youngest_live_version;
        let released = before - (state.old_mappings.len() + state.old_tables.len());

        if released > 0 {
            tracing::trace!(
                released,
                oldest_live_version,
                youngest_live_version,
                "purged retained mappings"
            );
        }
        released
    }

    pub fn stats(&self) -> MappingStats {
        let state = self.state.lock();
        MappingStats {
            live_sections: state.current.section_count(),
            retained_mappings: state.old_mappings.len(),
            retained_tables: state.old_tables.len(),
            mapped_bytes: state.current.file_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_SECTION_SHIFT;
    use crate::error::ErrorKind;

    const SECTION: u64 = 1 << MIN_SECTION_SHIFT;

    fn buffer_of(len: usize) -> Backing {
        let backing = Backing::from_buffer(Vec::new(), None);
        backing.grow_to(len as u64).unwrap();
        backing
    }

    #[test]
    fn translate_resolves_across_sections() {
        let backing = buffer_of(3 * SECTION as usize);
        backing.write_data(SECTION + 8, b"abcd").unwrap();
        backing.write_data(2 * SECTION + 16, b"wxyz").unwrap();
        let manager = MappingManager::new(MIN_SECTION_SHIFT, 1);

        let table = manager.update_reader_view(&backing, 3 * SECTION).unwrap();

        assert_eq!(table.section_count(), 3);
        assert_eq!(&table.translate(SECTION + 8).unwrap()[..4], b"abcd");
        assert_eq!(&table.translate(2 * SECTION + 16).unwrap()[..4], b"wxyz");
        assert_eq!(table.translate(SECTION + 8).unwrap().len(), SECTION as usize - 8);
    }

    #[test]
    fn translate_past_end_is_invalid_ref() {
        let backing = buffer_of(4096);
        let manager = MappingManager::new(MIN_SECTION_SHIFT, 1);
        let table = manager.update_reader_view(&backing, 4096).unwrap();

        let err = table.translate(4096).unwrap_err();
        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::InvalidRef));
    }

    #[test]
    fn full_sections_are_shared_between_tables() {
        let backing = buffer_of(2 * SECTION as usize);
        let manager = MappingManager::new(MIN_SECTION_SHIFT, 1);

        let first = manager.update_reader_view(&backing, SECTION).unwrap();
        let second = manager.update_reader_view(&backing, 2 * SECTION).unwrap();

        assert!(Arc::ptr_eq(
            first.mapping(0).unwrap(),
            second.mapping(0).unwrap()
        ));
        assert_eq!(manager.stats().retained_mappings, 0);
        assert_eq!(manager.stats().retained_tables, 1);
    }

    #[test]
    fn shrinking_request_keeps_current_view() {
        let backing = buffer_of(8192);
        let manager = MappingManager::new(MIN_SECTION_SHIFT, 1);

        let big = manager.update_reader_view(&backing, 8192).unwrap();
        let same = manager.update_reader_view(&backing, 4096).unwrap();

        assert!(Arc::ptr_eq(&big, &same));
    }

    #[test]
    fn old_partial_mapping_outlives_growth_for_its_reader() {
        let backing = buffer_of(4096);
        backing.write_data(64, b"old!").unwrap();
        let manager = MappingManager::new(MIN_SECTION_SHIFT, 1);
        let reader_view = manager.update_reader_view(&backing, 4096).unwrap();

        backing.grow_to(8192).unwrap();
        manager.update_reader_view(&backing, 8192).unwrap();
        manager.purge_old_mappings(10, 10);

        assert_eq!(manager.stats().retained_mappings, 0);
        assert_eq!(&reader_view.translate(64).unwrap()[..4], b"old!");
    }

    #[test]
    fn superseded_table_stays_alive_until_purged() {
        let backing = buffer_of(8192);
        let manager = MappingManager::new(MIN_SECTION_SHIFT, 1);
        let first = Arc::downgrade(&manager.update_reader_view(&backing, 4096).unwrap());

        manager.update_reader_view(&backing, 8192).unwrap();
        assert!(first.upgrade().is_some());

        manager.purge_old_mappings(2, 2);
        assert!(first.upgrade().is_none());
    }

    #[test]
    fn purge_releases_by_replacement_tag() {
        let backing = buffer_of(SECTION as usize);
        let manager = MappingManager::new(MIN_SECTION_SHIFT, 5);

        manager.update_reader_view(&backing, 4096).unwrap();
        manager.purge_old_mappings(5, 5);

        // v6 grows the partial section: the 4K mapping is tagged 5.
        manager.update_reader_view(&backing, 8192).unwrap();
        manager.purge_old_mappings(5, 6);

        // v7 grows it again: the 8K mapping is tagged 6.
        manager.update_reader_view(&backing, 12288).unwrap();
        assert_eq!(manager.purge_old_mappings(5, 7), 0);
        assert_eq!(manager.stats().retained_mappings, 2);

        assert_eq!(manager.purge_old_mappings(7, 7), 4);
        assert_eq!(manager.stats().retained_mappings, 0);
        assert_eq!(manager.stats().retained_tables, 0);
    }
}
