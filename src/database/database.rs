//! # Database Handle
//!
//! `Database` is a cheap, cloneable handle to one attached store. All clones
//! share a [`SharedDatabase`] holding the backing store, the mapping manager,
//! the version manager and the parked allocator.
//!
//! ## The Parked Allocator
//!
//! There is one `SlabAlloc` per attached database. While no write transaction
//! runs it sits in `allocator`; `begin_write` takes it out and the write
//! transaction owns it until commit or rollback puts it back. Holding the
//! writer lock and owning the allocator always go together.
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. grow the file to the committed size, write slab bytes below it, sync
//! 2. replication.on_prepare_commit(old) -> new version
//! 3. header: new top-ref into the inactive slot, sync, flip selector, sync
//! 4. publish (control block + ring), wake waiters
//! 5. extend the reader view, rebase the allocator onto the new size
//! 6. park the allocator, release the writer lock
//! 7. replication.on_finalize_commit(), purge retained mappings
//! ```
//!
//! A failure in steps 1-3 leaves the previous version authoritative: the
//! bytes written past the committed size are simply overwritten by the next
//! writer.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, eyre, Result, WrapErr};
use parking_lot::Mutex;

use super::builder::DatabaseBuilder;
use super::config::Config;
use super::transaction::Transaction;
use crate::alloc::{AllocOptions, AllocatorMetrics, Ref, SlabAlloc};
use crate::config::ALLOC_ALIGNMENT;
use crate::error::ArenaError;
use crate::mvcc::{
    ControlBlock, PublishedVersion, ReadLockInfo, RingStats, VersionAttach, VersionManager,
    WriterLock,
};
use crate::replication::Replication;
use crate::storage::{
    inspect, upgrade_streaming_header, AttachMode, Backing, Encryption, MappingManager,
    MappingStats, OpenMode, PageCipher, StorageKind, TranslationTable,
};

pub(crate) struct SharedDatabase {
    pub(crate) config: Config,
    pub(crate) backing: Backing,
    pub(crate) mappings: MappingManager,
    pub(crate) versions: VersionManager,
    pub(crate) allocator: Mutex<Option<SlabAlloc>>,
    pub(crate) replication: Arc<dyn Replication>,
}

impl fmt::Debug for SharedDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDatabase")
            .field("config", &self.config)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseMetrics {
    pub latest_version: u64,
    pub ring: RingStats,
    pub mappings: MappingStats,
    /// `None` while a write transaction owns the allocator.
    pub allocator: Option<AllocatorMetrics>,
    pub recovered_writers: u64,
    pub commits_published: u64,
}

#[derive(Debug, Clone)]
pub struct Database {
    pub(crate) shared: Arc<SharedDatabase>,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Opens or creates the database file at `path` with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open()
    }

    /// Creates an empty in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::builder().buffer(Vec::new()).open()
    }

    pub(crate) fn open_with(
        kind: StorageKind,
        config: Config,
        cipher: Option<Arc<dyn PageCipher>>,
        replication: Arc<dyn Replication>,
    ) -> Result<Self> {
        config.validate(cipher.is_some())?;

        let encryption = match (config.encryption_key, cipher) {
            (Some(key), Some(cipher)) => Some(Encryption::new(key, cipher)),
            _ => None,
        };

        let backing = Backing::open(
            kind,
            OpenMode {
                read_only: config.read_only,
                no_create: config.no_create,
            },
            encryption,
        )?;

        let store = inspect(
            &backing,
            AttachMode {
                read_only: config.read_only,
                session_initiator: config.session_initiator,
            },
        )?;

        let (control, writer) = match backing.path() {
            Some(path) => {
                let control = ControlBlock::open_shared(path, config.read_only)?;
                let lock_file = match (config.read_only, control.lock_file()) {
                    (false, Some(file)) => Some(
                        file.try_clone()
                            .wrap_err("failed to duplicate lock file handle")?,
                    ),
                    _ => None,
                };
                (control, WriterLock::new(lock_file))
            }
            None => (ControlBlock::local(), WriterLock::new(None)),
        };

        let versions = VersionManager::attach(
            control,
            writer,
            &store,
            VersionAttach {
                read_only: config.read_only,
                session_initiator: config.session_initiator,
                ring_capacity: config.initial_ring_capacity,
            },
        )?;

        let latest = versions.latest();
        let physical = backing.len()?;
        ensure!(
            latest.file_size <= physical,
            ArenaError::invalid_format(format!(
                "committed size {} exceeds store size {}",
                latest.file_size, physical
            ))
        );

        let mappings = MappingManager::new(config.section_shift, latest.version);
        let table = mappings.update_reader_view(&backing, latest.file_size)?;
        let allocator = SlabAlloc::attach(
            table,
            latest.file_size,
            AllocOptions {
                section_shift: config.section_shift,
                memory_limit: config.slab_memory_limit,
            },
        )?;

        tracing::debug!(
            path = ?backing.path(),
            version = latest.version,
            top_ref = latest.top_ref,
            file_size = latest.file_size,
            streaming = store.streaming,
            read_only = config.read_only,
            "attached database"
        );

        Ok(Self {
            shared: Arc::new(SharedDatabase {
                config,
                backing,
                mappings,
                versions,
                allocator: Mutex::new(Some(allocator)),
                replication,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.backing.path()
    }

    /// The whole store of an in-memory database. `None` for files.
    pub fn buffer_contents(&self) -> Option<Vec<u8>> {
        self.shared.backing.buffer_contents()
    }

    pub fn latest_version(&self) -> u64 {
        self.shared.versions.latest().version
    }

    /// Starts a read transaction on `version`, or on the latest version.
    pub fn begin_read(&self, version: Option<u64>) -> Result<Transaction> {
        let shared = &self.shared;
        let lock = shared.versions.grab_read_lock(version)?;
        let view = match shared.view_for(&lock) {
            Ok(view) => view,
            Err(e) => {
                shared.release_read_lock(&lock);
                return Err(e);
            }
        };
        shared.replication.on_initiate(lock.version, false);
        Ok(Transaction::reading(self.clone(), lock, view))
    }

    /// Starts a write transaction on the latest version. With `nonblocking`,
    /// returns `Ok(None)` instead of waiting for another writer.
    pub fn begin_write(&self, nonblocking: bool) -> Result<Option<Transaction>> {
        Ok(self
            .shared
            .start_write(nonblocking)?
            .map(|(lock, view, alloc)| Transaction::writing(self.clone(), lock, view, alloc)))
    }

    /// Makes every current and future `wait_for_change` return immediately.
    pub fn release_wait_for_change(&self) {
        self.shared.versions.release_wait_for_change();
    }

    pub fn enable_wait_for_change(&self) {
        self.shared.versions.enable_wait_for_change();
    }

    /// Drops retained mappings no live reader can need. Returns how many were
    /// released.
    pub fn purge_old_mappings(&self) -> usize {
        self.shared.purge_old_mappings()
    }

    pub fn metrics(&self) -> DatabaseMetrics {
        let shared = &self.shared;
        DatabaseMetrics {
            latest_version: shared.versions.latest().version,
            ring: shared.versions.ring_stats(),
            mappings: shared.mappings.stats(),
            allocator: shared.allocator.lock().as_ref().map(SlabAlloc::metrics),
            recovered_writers: shared.versions.recovered_writers(),
            commits_published: shared.versions.commits_published(),
        }
    }
}

type WriteStart = (ReadLockInfo, Arc<TranslationTable>, SlabAlloc);

impl SharedDatabase {
    pub(crate) fn view_for(&self, lock: &ReadLockInfo) -> Result<Arc<TranslationTable>> {
        self.mappings
            .update_reader_view(&self.backing, lock.file_size)
            .wrap_err_with(|| format!("failed to map version {}", lock.version))
    }

    pub(crate) fn release_read_lock(&self, lock: &ReadLockInfo) {
        if let Err(e) = self.versions.release_read_lock(lock) {
            tracing::warn!(error = %e, version = lock.version, "failed to release read lock");
        }
    }

    pub(crate) fn start_write(&self, nonblocking: bool) -> Result<Option<WriteStart>> {
        ensure!(!self.config.read_only, ArenaError::ReadOnly);

        if !self.versions.acquire_writer(nonblocking)? {
            return Ok(None);
        }

        match self.prepare_write() {
            Ok(start) => Ok(Some(start)),
            Err(e) => {
                self.versions.release_writer();
                Err(e)
            }
        }
    }

    fn prepare_write(&self) -> Result<WriteStart> {
        upgrade_streaming_header(&self.backing)?;

        let lock = self.versions.grab_read_lock(None)?;
        let prepared = self.view_for(&lock).and_then(|view| {
            let mut alloc = self
                .allocator
                .lock()
                .take()
                .ok_or_else(|| eyre!("allocator is owned by another write transaction"))?;
            if alloc.baseline() != lock.file_size {
                if let Err(e) = alloc.rebase(Arc::clone(&view), lock.file_size) {
                    *self.allocator.lock() = Some(alloc);
                    return Err(e);
                }
            }
            Ok((view, alloc))
        });

        match prepared {
            Ok((view, alloc)) => {
                self.replication.on_initiate(lock.version, true);
                tracing::trace!(version = lock.version, "began write transaction");
                Ok((lock, view, alloc))
            }
            Err(e) => {
                self.release_read_lock(&lock);
                Err(e)
            }
        }
    }

    /// Parks the allocator and releases the writer lock.
    pub(crate) fn finish_write(&self, alloc: SlabAlloc) {
        *self.allocator.lock() = Some(alloc);
        self.versions.release_writer();
    }

    pub(crate) fn commit_write(
        &self,
        lock: &ReadLockInfo,
        alloc: &mut SlabAlloc,
        top_ref: Ref,
    ) -> Result<PublishedVersion> {
        let new_size = alloc.committed_size();
        ensure!(
            top_ref % ALLOC_ALIGNMENT as Ref == 0 && top_ref < new_size,
            ArenaError::InvalidRef { reference: top_ref }
        );

        if new_size > alloc.baseline() {
            self.backing.grow_to(new_size)?;
            for (at, bytes) in alloc.slabs_below(new_size) {
                self.backing
                    .write_data(at, bytes)
                    .wrap_err_with(|| format!("failed to flush slab at ref {}", at))?;
            }
        }
        self.backing.sync()?;

        let new_version = self.replication.on_prepare_commit(lock.version)?;
        ensure!(
            new_version > lock.version,
            "replication chose version {} which does not follow {}",
            new_version,
            lock.version
        );

        let staged = self.backing.read_header()?.with_staged_top(top_ref);
        self.backing.write_header(&staged)?;
        self.backing.sync()?;
        self.backing.write_header(&staged.with_flipped_selector())?;
        self.backing.sync()?;

        let published = PublishedVersion {
            version: new_version,
            top_ref,
            file_size: new_size,
        };
        self.versions.publish_commit(published)?;

        // The commit is durable and visible from here on. A failure to extend
        // the view is left for the next writer, which rebases on its own.
        let rebased = self
            .mappings
            .update_reader_view(&self.backing, new_size)
            .and_then(|table| alloc.rebase(table, new_size));
        if let Err(e) = rebased {
            tracing::warn!(error = %e, version = new_version, "reader view not extended after commit");
        }

        tracing::debug!(
            version = new_version,
            top_ref,
            file_size = new_size,
            "committed write transaction"
        );
        Ok(published)
    }

    pub(crate) fn purge_old_mappings(&self) -> usize {
        let (oldest, youngest) = self.versions.live_range();
        self.mappings.purge_old_mappings(oldest, youngest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn open_creates_file_and_lock_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.db");

        let db = Database::open(&path).unwrap();

        assert!(path.exists());
        assert!(crate::mvcc::lock_file_path(&path).exists());
        assert_eq!(db.latest_version(), crate::config::INITIAL_VERSION);
    }

    #[test]
    fn read_only_database_rejects_writers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.db");
        drop(Database::open(&path).unwrap());

        let db = Database::builder().path(&path).read_only(true).open().unwrap();

        let err = db.begin_write(false).unwrap_err();
        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::ReadOnly));
        assert!(db.begin_read(None).is_ok());
    }

    #[test]
    fn commit_publishes_new_version_and_size() {
        let db = Database::in_memory().unwrap();

        let mut txn = db.begin_write(false).unwrap().unwrap();
        let r = txn.allocate(64).unwrap();
        txn.set_top_ref(r).unwrap();
        let version = txn.commit().unwrap();

        let metrics = db.metrics();
        assert_eq!(version, 2);
        assert_eq!(metrics.latest_version, 2);
        assert_eq!(metrics.allocator.unwrap().baseline, 8192);
        assert_eq!(metrics.allocator.unwrap().slab_count, 0);
    }

    #[test]
    fn small_commits_grow_the_file_by_one_granule() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("growth.db");
        let db = Database::open(&path).unwrap();

        for round in 0..100u64 {
            let mut txn = db.begin_write(false).unwrap().unwrap();
            let r = txn.allocate(8).unwrap();
            txn.translate_mut(r).unwrap()[..8].copy_from_slice(&round.to_le_bytes());
            txn.set_top_ref(r).unwrap();
            txn.commit().unwrap();
        }

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 101 * crate::config::FILE_GRANULE as u64);
        let reader = db.begin_read(None).unwrap();
        assert_eq!(&reader.translate(reader.top_ref()).unwrap()[..8], &99u64.to_le_bytes());
    }

    #[test]
    fn allocator_is_unavailable_to_metrics_while_writing() {
        let db = Database::in_memory().unwrap();

        let txn = db.begin_write(false).unwrap().unwrap();
        assert!(db.metrics().allocator.is_none());

        drop(txn);
        assert!(db.metrics().allocator.is_some());
    }

    #[test]
    fn unaligned_top_ref_fails_commit_and_rolls_back() {
        let db = Database::in_memory().unwrap();
        let mut txn = db.begin_write(false).unwrap().unwrap();
        txn.allocate(8).unwrap();
        txn.set_top_ref(13).unwrap();

        let err = txn.commit().unwrap_err();

        assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::InvalidRef));
        assert_eq!(db.latest_version(), 1);
        assert!(db.begin_write(true).unwrap().is_some());
    }
}
