//! # Transactions
//!
//! A `Transaction` pins one committed version for reading and, while in the
//! `Writing` stage, owns the allocator that builds the next one.
//!
//! ## Stages
//!
//! | Stage     | Holds                           | Allowed operations                      |
//! |-----------|---------------------------------|-----------------------------------------|
//! | `Ready`   | nothing                         | none, the handle is spent               |
//! | `Reading` | read lock, view                 | translate, advance_read, promote, freeze|
//! | `Writing` | read lock, view, allocator, lock| allocate, free, translate(_mut), commit |
//! | `Frozen`  | read lock, view                 | translate, freeze                       |
//!
//! Reading and Frozen transactions only read immutable committed bytes, so
//! `translate` borrows straight from the mapping. A `Writing` transaction
//! translates through its allocator, which sees both the committed baseline
//! and its own slabs.
//!
//! Dropping a transaction releases what it holds; a `Writing` transaction is
//! rolled back first.

use std::sync::Arc;

use eyre::{ensure, eyre, Result};

use super::database::Database;
use crate::alloc::{AllocatorMetrics, Ref, SlabAlloc};
use crate::error::ArenaError;
use crate::mvcc::{ReadLockInfo, TxnStage};
use crate::storage::TranslationTable;

#[derive(Debug)]
struct WriteState {
    alloc: SlabAlloc,
    top_ref: Ref,
}

#[derive(Debug)]
pub struct Transaction {
    db: Database,
    stage: TxnStage,
    read_lock: Option<ReadLockInfo>,
    view: Option<Arc<TranslationTable>>,
    write: Option<WriteState>,
}

impl Transaction {
    pub(crate) fn reading(db: Database, lock: ReadLockInfo, view: Arc<TranslationTable>) -> Self {
        Self {
            db,
            stage: TxnStage::Reading,
            read_lock: Some(lock),
            view: Some(view),
            write: None,
        }
    }

    pub(crate) fn writing(
        db: Database,
        lock: ReadLockInfo,
        view: Arc<TranslationTable>,
        alloc: SlabAlloc,
    ) -> Self {
        Self {
            db,
            stage: TxnStage::Writing,
            read_lock: Some(lock),
            view: Some(view),
            write: Some(WriteState {
                alloc,
                top_ref: lock.top_ref,
            }),
        }
    }

    pub fn stage(&self) -> TxnStage {
        self.stage
    }

    /// The version this transaction reads, or started writing from.
    pub fn version(&self) -> Option<u64> {
        self.read_lock.map(|l| l.version)
    }

    pub fn read_lock(&self) -> Option<ReadLockInfo> {
        self.read_lock
    }

    /// The top-ref the transaction currently sees: the committed one while
    /// reading, the staged one while writing. 0 when `Ready`.
    pub fn top_ref(&self) -> Ref {
        match (&self.write, &self.read_lock) {
            (Some(write), _) => write.top_ref,
            (None, Some(lock)) => lock.top_ref,
            (None, None) => 0,
        }
    }

    pub fn set_top_ref(&mut self, top_ref: Ref) -> Result<()> {
        self.write_state()?.top_ref = top_ref;
        Ok(())
    }

    pub fn allocate(&mut self, size: usize) -> Result<Ref> {
        self.write_state()?.alloc.allocate(size)
    }

    pub fn free(&mut self, reference: Ref, size: usize) -> Result<()> {
        self.write_state()?.alloc.free(reference, size)
    }

    pub fn translate(&self, reference: Ref) -> Result<&[u8]> {
        if let Some(write) = &self.write {
            return write.alloc.translate(reference);
        }

        let (Some(lock), Some(view)) = (&self.read_lock, &self.view) else {
            return Err(self.wrong_stage("reading, frozen or writing"));
        };
        ensure!(
            reference != 0 && reference < lock.file_size,
            ArenaError::InvalidRef { reference }
        );
        let bytes = view.translate(reference)?;
        let limit = (lock.file_size - reference) as usize;
        Ok(&bytes[..bytes.len().min(limit)])
    }

    pub fn translate_mut(&mut self, reference: Ref) -> Result<&mut [u8]> {
        self.write_state()?.alloc.translate_mut(reference)
    }

    /// Allocator metrics while `Writing`.
    pub fn allocator_metrics(&self) -> Option<AllocatorMetrics> {
        self.write.as_ref().map(|w| w.alloc.metrics())
    }

    /// Commits and ends the transaction. Returns the new version.
    pub fn commit(&mut self) -> Result<u64> {
        let version = self.commit_inner()?;
        self.drop_read_lock();
        self.stage = TxnStage::Ready;
        self.db.shared.purge_old_mappings();
        Ok(version)
    }

    /// Commits and keeps reading the version just committed.
    pub fn commit_and_continue_as_read(&mut self) -> Result<u64> {
        let version = self.commit_inner()?;
        let shared = &self.db.shared;

        let lock = shared.versions.grab_read_lock(Some(version))?;
        let view = match shared.view_for(&lock) {
            Ok(view) => view,
            Err(e) => {
                shared.release_read_lock(&lock);
                self.drop_read_lock();
                self.stage = TxnStage::Ready;
                return Err(e);
            }
        };

        self.drop_read_lock();
        self.read_lock = Some(lock);
        self.view = Some(view);
        self.stage = TxnStage::Reading;
        self.db.shared.purge_old_mappings();
        Ok(version)
    }

    fn commit_inner(&mut self) -> Result<u64> {
        self.expect_stage(TxnStage::Writing, "writing")?;
        let lock = self
            .read_lock
            .ok_or_else(|| eyre!("write transaction without a read lock"))?;
        let mut write = self
            .write
            .take()
            .ok_or_else(|| eyre!("write transaction without an allocator"))?;
        let shared = &self.db.shared;

        match shared.commit_write(&lock, &mut write.alloc, write.top_ref) {
            Ok(published) => {
                shared.finish_write(write.alloc);
                shared.replication.on_finalize_commit();
                Ok(published.version)
            }
            Err(e) => {
                tracing::warn!(error = %e, version = lock.version, "commit failed, rolling back");
                shared.replication.on_abort();
                write.alloc.discard_uncommitted();
                shared.finish_write(write.alloc);
                self.stage = TxnStage::Reading;
                Err(e)
            }
        }
    }

    /// Discards every change and returns to reading the version the write
    /// started from.
    pub fn rollback(&mut self) -> Result<()> {
        self.expect_stage(TxnStage::Writing, "writing")?;
        let Some(mut write) = self.write.take() else {
            return Err(eyre!("write transaction without an allocator"));
        };
        let shared = &self.db.shared;

        shared.replication.on_abort();
        write.alloc.discard_uncommitted();
        shared.finish_write(write.alloc);
        self.stage = TxnStage::Reading;

        tracing::debug!(version = ?self.version(), "rolled back write transaction");
        Ok(())
    }

    /// Turns a read transaction into a write transaction on the latest
    /// version. Returns `Ok(false)`, still reading, when `nonblocking` and
    /// another writer is active.
    pub fn promote_to_write(&mut self, nonblocking: bool) -> Result<bool> {
        self.expect_stage(TxnStage::Reading, "reading")?;
        let Some((lock, view, alloc)) = self.db.shared.start_write(nonblocking)? else {
            return Ok(false);
        };

        self.drop_read_lock();
        self.read_lock = Some(lock);
        self.view = Some(view);
        self.write = Some(WriteState {
            alloc,
            top_ref: lock.top_ref,
        });
        self.stage = TxnStage::Writing;
        Ok(true)
    }

    /// Moves a read transaction to `version`, or to the latest version.
    pub fn advance_read(&mut self, version: Option<u64>) -> Result<()> {
        self.expect_stage(TxnStage::Reading, "reading")?;
        let shared = &self.db.shared;

        let lock = shared.versions.grab_read_lock(version)?;
        let view = match shared.view_for(&lock) {
            Ok(view) => view,
            Err(e) => {
                shared.release_read_lock(&lock);
                return Err(e);
            }
        };

        self.drop_read_lock();
        self.read_lock = Some(lock);
        self.view = Some(view);
        Ok(())
    }

    /// A new frozen handle pinning this transaction's version.
    pub fn freeze(&self) -> Result<Transaction> {
        if !matches!(self.stage, TxnStage::Reading | TxnStage::Frozen) {
            return Err(self.wrong_stage("reading or frozen"));
        }
        let (Some(current), Some(view)) = (&self.read_lock, &self.view) else {
            return Err(self.wrong_stage("reading or frozen"));
        };

        let lock = self
            .db
            .shared
            .versions
            .grab_read_lock(Some(current.version))?;
        Ok(Self {
            db: self.db.clone(),
            stage: TxnStage::Frozen,
            read_lock: Some(lock),
            view: Some(Arc::clone(view)),
            write: None,
        })
    }

    /// Releases the read lock. The handle is spent afterwards.
    pub fn end_read(&mut self) -> Result<()> {
        if !matches!(self.stage, TxnStage::Reading | TxnStage::Frozen) {
            return Err(self.wrong_stage("reading or frozen"));
        }
        self.drop_read_lock();
        self.stage = TxnStage::Ready;
        Ok(())
    }

    /// Blocks until a version newer than this transaction's is committed.
    /// Returns `false` when woken by `Database::release_wait_for_change`.
    pub fn wait_for_change(&self) -> Result<bool> {
        let Some(lock) = &self.read_lock else {
            return Err(self.wrong_stage("reading, frozen or writing"));
        };
        Ok(self.db.shared.versions.wait_for_change(lock.version))
    }

    fn write_state(&mut self) -> Result<&mut WriteState> {
        let actual = self.stage.name();
        self.write.as_mut().ok_or_else(|| {
            eyre::Report::new(ArenaError::WrongTransactionState {
                expected: "writing",
                actual,
            })
        })
    }

    fn expect_stage(&self, stage: TxnStage, expected: &'static str) -> Result<()> {
        if self.stage != stage {
            return Err(self.wrong_stage(expected));
        }
        Ok(())
    }

    fn wrong_stage(&self, expected: &'static str) -> eyre::Report {
        eyre::Report::new(ArenaError::WrongTransactionState {
            expected,
            actual: self.stage.name(),
        })
    }

    fn drop_read_lock(&mut self) {
        if let Some(lock) = self.read_lock.take() {
            self.db.shared.release_read_lock(&lock);
        }
        self.view = None;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.stage == TxnStage::Writing {
            if let Err(e) = self.rollback() {
                tracing::warn!(error = %e, "rollback on drop failed");
            }
        }
        self.drop_read_lock();
    }
}
