//! # Version Manager
//!
//! Owns everything that decides which committed version a transaction sees:
//!
//! - the read-lock ring (versions still pinned by readers in this process)
//! - the shared control block (the latest version across processes)
//! - the writer lock
//! - change notification for `wait_for_change`
//!
//! ## Cross-Process Versions
//!
//! Another process's commits reach this one only through the control block.
//! Whenever a caller asks for the latest version, the control block is read
//! and, if it moved, the new version is appended to the local ring. The ring
//! therefore holds every local commit but only those foreign commits someone
//! here asked about.
//!
//! ## Attach and the Session Initiator
//!
//! ```text
//!                     control initialized?
//!                     yes                    no
//! initiator       reconcile with header   initialize from header
//! non-initiator   use it                  Retry
//! ```
//!
//! Reconciling covers a writer that died between switching the header and
//! publishing: the header then names a top-ref the control block has never
//! seen, and the header wins.
//!
//! ## Waiting for Change
//!
//! ```text
//! observed = control.change_count()
//! lock state: sync with control; newer version? -> true; released? -> false
//! unlock, control.wait_change(observed)          (futex on the lock file)
//! ```
//!
//! Commits in any process and `release_wait_for_change` bump the change word
//! after updating what the waiter checks, so a bump between the check and
//! the sleep makes the sleep return at once. Control blocks that cannot block
//! (read-only attaches, platforms without futexes) wait on the in-process
//! condvar for at most `CHANGE_POLL_INTERVAL_MS` per round instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use eyre::{bail, Result};
use parking_lot::{Condvar, Mutex};

use super::control::ControlBlock;
use super::ring::{PublishedVersion, ReadLockInfo, ReadLockRing, RingStats};
use super::writer_lock::WriterLock;
use crate::config::{CHANGE_POLL_INTERVAL_MS, INITIAL_VERSION};
use crate::error::ArenaError;
use crate::storage::StoreInfo;

#[derive(Debug)]
struct VersionState {
    ring: ReadLockRing,
    wait_enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct VersionAttach {
    pub read_only: bool,
    pub session_initiator: bool,
    pub ring_capacity: usize,
}

#[derive(Debug)]
pub struct VersionManager {
    state: Mutex<VersionState>,
    changed: Condvar,
    control: ControlBlock,
    writer: WriterLock,
    recovered_writers: AtomicU64,
}

impl VersionManager {
    pub fn attach(
        mut control: ControlBlock,
        writer: WriterLock,
        store: &StoreInfo,
        mode: VersionAttach,
    ) -> Result<Self> {
        let from_store = PublishedVersion {
            version: INITIAL_VERSION,
            top_ref: store.top_ref,
            file_size: store.file_size,
        };

        if !control.is_shared() {
            control.initialize(from_store)?;
        } else if mode.read_only {
            if !control.is_initialized() {
                control = ControlBlock::local();
                control.initialize(from_store)?;
            }
        } else if mode.session_initiator {
            writer.acquire(false)?;
            let reconciled = reconcile(&control, store, from_store);
            writer.release();
            reconciled?;
        } else if !control.is_initialized() {
            bail!(ArenaError::retry(
                "the session initiator has not initialized the control block"
            ));
        }

        let published = control.read();
        tracing::debug!(
            version = published.version,
            top_ref = published.top_ref,
            file_size = published.file_size,
            shared = control.is_shared(),
            "attached version manager"
        );

        Ok(Self {
            state: Mutex::new(VersionState {
                ring: ReadLockRing::new(mode.ring_capacity, published),
                wait_enabled: true,
            }),
            changed: Condvar::new(),
            control,
            writer,
            recovered_writers: AtomicU64::new(0),
        })
    }

    fn sync_with_control(&self, state: &mut VersionState) {
        let published = self.control.read();
        if published.version > state.ring.newest().version {
            if let Err(e) = state.ring.append(published) {
                tracing::warn!(error = %e, "ignoring control block publication");
                return;
            }
            state.ring.prune();
        }
    }

    pub fn latest(&self) -> PublishedVersion {
        let mut state = self.state.lock();
        self.sync_with_control(&mut state);
        state.ring.newest()
    }

    /// Pins `version`, or the latest version when `None`.
    pub fn grab_read_lock(&self, version: Option<u64>) -> Result<ReadLockInfo> {
        let mut state = self.state.lock();
        self.sync_with_control(&mut state);
        match version {
            None => Ok(state.ring.grab_latest()),
            Some(version) => state.ring.grab(version),
        }
    }

    pub fn release_read_lock(&self, lock: &ReadLockInfo) -> Result<()> {
        self.state.lock().ring.release(lock)?;
        Ok(())
    }

    /// Oldest and youngest versions still in the ring.
    pub fn live_range(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.ring.oldest().version, state.ring.newest().version)
    }

    pub fn ring_stats(&self) -> RingStats {
        self.state.lock().ring.stats()
    }

    /// Takes the writer lock. Returns `Ok(false)` when `nonblocking` and
    /// another writer holds it.
    pub fn acquire_writer(&self, nonblocking: bool) -> Result<bool> {
        if !self.writer.acquire(nonblocking)? {
            return Ok(false);
        }
        self.note_previous_writer();
        Ok(true)
    }

    pub fn release_writer(&self) {
        self.control.clear_writer();
        self.writer.release();
    }

    fn note_previous_writer(&self) {
        let previous = self.control.mark_writer(u64::from(std::process::id()));
        if previous != 0 {
            self.recovered_writers.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                previous_pid = previous,
                "previous writer exited without releasing; its transaction is rolled back"
            );
        }
    }

    /// Number of writers found dead while acquiring the lock.
    pub fn recovered_writers(&self) -> u64 {
        self.recovered_writers.load(Ordering::Relaxed)
    }

    /// Publishes a commit and wakes every waiter. The caller holds the
    /// writer lock.
    pub fn publish_commit(&self, published: PublishedVersion) -> Result<()> {
        self.control.publish(published);
        let mut state = self.state.lock();
        state.ring.append(published)?;
        state.ring.prune();
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Blocks until a version newer than `since` is committed, or until
    /// `release_wait_for_change` is called. Returns whether a change was seen.
    pub fn wait_for_change(&self, since: u64) -> bool {
        let mut blocking = self.control.can_block_on_change();
        loop {
            let observed = self.control.change_count();
            {
                let mut state = self.state.lock();
                self.sync_with_control(&mut state);
                if state.ring.newest().version > since {
                    return true;
                }
                if !state.wait_enabled {
                    return false;
                }
                if !blocking {
                    self.changed
                        .wait_for(&mut state, Duration::from_millis(CHANGE_POLL_INTERVAL_MS));
                    continue;
                }
            }
            if let Err(e) = self.control.wait_change(observed) {
                tracing::warn!(error = %e, "falling back to bounded waits for change");
                blocking = false;
            }
        }
    }

    pub fn release_wait_for_change(&self) {
        self.state.lock().wait_enabled = false;
        self.changed.notify_all();
        self.control.notify_change();
    }

    pub fn enable_wait_for_change(&self) {
        self.state.lock().wait_enabled = true;
    }

    pub fn commits_published(&self) -> u64 {
        self.control.commits()
    }
}

fn reconcile(control: &ControlBlock, store: &StoreInfo, from_store: PublishedVersion) -> Result<()> {
    if !control.is_initialized() {
        return control.initialize(from_store);
    }

    let previous = control.mark_writer(0);
    if previous != 0 {
        tracing::warn!(previous_pid = previous, "session initiator found a dead writer");
    }

    let published = control.read();
    if published.top_ref != store.top_ref || published.file_size > store.file_size {
        tracing::warn!(
            control_top = published.top_ref,
            header_top = store.top_ref,
            "control block disagrees with file header; header wins"
        );
        return control.initialize(PublishedVersion {
            version: published.version + 1,
            ..from_store
        });
    }
    Ok(())
}
