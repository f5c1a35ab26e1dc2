//! # Shared Control Block
//!
//! Processes attached to the same database agree on the latest committed
//! version through a small block of atomics stored in `<db>.lock` and mapped
//! shared by every process. The same file carries the interprocess writer
//! lock (see `writer_lock`).
//!
//! ## Layout (64 bytes, native endian, process-shared)
//!
//! ```text
//! Offset  Field           Description
//! ------  --------------  ------------------------------------------------
//! 0       magic           CONTROL_MAGIC once the session initiator ran
//! 8       seq             Seqlock sequence, odd while a publish is running
//! 16      version         Latest committed version
//! 24      top_ref         Its top-ref
//! 32      file_size       Its committed file size
//! 40      writer_active   Pid of the writer holding the lock, 0 when none
//! 48      commits         Commits published since the block was created
//! 56      change (u32)    Bumped on every commit and wait release
//! 60      reserved (u32)
//! ```
//!
//! ## Seqlock Publication
//!
//! Only the writer publishes, and it holds the writer lock while doing so:
//!
//! ```text
//! writer: seq += 1 (odd) -> store version, top_ref, file_size -> seq += 1
//! reader: s1 = seq -> load fields -> s2 = seq -> retry unless s1 == s2, even
//! ```
//!
//! A process that dies between the two increments leaves `seq` odd. The next
//! writer repairs it before publishing. Readers spinning on an odd sequence
//! give up after a bounded number of attempts and fall back to the last
//! publication this block read consistently.
//!
//! ## Change Notification
//!
//! `change` is the interprocess condition word. On Linux a waiter reads it,
//! checks its wake condition, then sleeps in `FUTEX_WAIT` while the word
//! still holds the value it read. A publish bumps the word after storing the
//! fields and issues `FUTEX_WAKE` to every sleeper in every process mapping
//! the lock file. Sleepers in read-only attaches cannot bump the word for
//! their own in-process releases and, like every waiter off Linux, use a
//! bounded wait instead (`can_block_on_change`).
//!
//! In-memory databases use a heap-allocated block with the same semantics.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;

use super::ring::PublishedVersion;
use crate::error::ArenaError;

const CONTROL_MAGIC: u64 = 0x4152_454E_4143_544C;
const CONTROL_BLOCK_SIZE: usize = 64;
const SEQLOCK_SPIN_LIMIT: u32 = 1 << 16;

#[repr(C)]
#[derive(Debug, Default)]
struct RawControl {
    magic: AtomicU64,
    seq: AtomicU64,
    version: AtomicU64,
    top_ref: AtomicU64,
    file_size: AtomicU64,
    writer_active: AtomicU64,
    commits: AtomicU64,
    change: AtomicU32,
    reserved: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<RawControl>() == CONTROL_BLOCK_SIZE);

#[derive(Debug)]
enum ControlRegion {
    Shared(MmapMut),
    SharedReadOnly(Mmap),
    Local(Box<RawControl>),
}

#[derive(Debug)]
pub struct ControlBlock {
    region: ControlRegion,
    lock_file: Option<File>,
    last_consistent: Mutex<Option<PublishedVersion>>,
}

/// `<db>.lock` next to the database file.
pub fn lock_file_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

impl ControlBlock {
    pub fn local() -> Self {
        Self {
            region: ControlRegion::Local(Box::default()),
            lock_file: None,
            last_consistent: Mutex::new(None),
        }
    }

    /// Opens (creating when writable) the lock file of `db_path` and maps its
    /// control block. A read-only attach of a database whose lock file does
    /// not exist falls back to a local block.
    pub fn open_shared(db_path: &Path, read_only: bool) -> Result<Self> {
        let path = lock_file_path(db_path);

        if read_only {
            let file = match OpenOptions::new().read(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::local()),
                Err(e) => {
                    return Err(eyre::Report::new(ArenaError::access(format!(
                        "failed to open lock file '{}': {}",
                        path.display(),
                        e
                    ))))
                }
            };
            if file.metadata().map(|m| m.len()).unwrap_or(0) < CONTROL_BLOCK_SIZE as u64 {
                return Ok(Self::local());
            }
            // SAFETY: The mapping is read-only and only ever accessed through
            // the atomics of RawControl. Concurrent stores by writers in
            // other processes go through the same atomics.
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .len(CONTROL_BLOCK_SIZE)
                    .map(&file)
                    .wrap_err_with(|| format!("failed to map lock file '{}'", path.display()))?
            };
            return Ok(Self {
                region: ControlRegion::SharedReadOnly(mmap),
                lock_file: Some(file),
                last_consistent: Mutex::new(None),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                eyre::Report::new(ArenaError::access(format!(
                    "failed to open lock file '{}': {}",
                    path.display(),
                    e
                )))
            })?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat lock file '{}'", path.display()))?
            .len();
        if len < CONTROL_BLOCK_SIZE as u64 {
            // Growing with set_len zero-fills, which reads as "uninitialized".
            file.set_len(CONTROL_BLOCK_SIZE as u64)
                .wrap_err_with(|| format!("failed to size lock file '{}'", path.display()))?;
        }

        // SAFETY: MmapMut::map_mut is unsafe because other processes may
        // modify the file. This is sound because:
        // 1. Every access goes through the AtomicU64 fields of RawControl
        // 2. The mapping is page aligned, satisfying AtomicU64 alignment
        // 3. The file is at least CONTROL_BLOCK_SIZE bytes and never shrinks
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .len(CONTROL_BLOCK_SIZE)
                .map_mut(&file)
                .wrap_err_with(|| format!("failed to map lock file '{}'", path.display()))?
        };

        Ok(Self {
            region: ControlRegion::Shared(mmap),
            lock_file: Some(file),
            last_consistent: Mutex::new(None),
        })
    }

    pub fn lock_file(&self) -> Option<&File> {
        self.lock_file.as_ref()
    }

    pub fn is_shared(&self) -> bool {
        !matches!(self.region, ControlRegion::Local(_))
    }

    fn raw(&self) -> &RawControl {
        let ptr = match &self.region {
            ControlRegion::Shared(mmap) => mmap.as_ptr(),
            ControlRegion::SharedReadOnly(mmap) => mmap.as_ptr(),
            ControlRegion::Local(raw) => return raw,
        };
        debug_assert_eq!(ptr as usize % std::mem::align_of::<RawControl>(), 0);
        // SAFETY: The mapping is CONTROL_BLOCK_SIZE bytes, page aligned, and
        // RawControl is repr(C) with only AtomicU64 fields, for which every
        // bit pattern is valid. The reference lives no longer than &self,
        // which owns the mapping.
        unsafe { &*(ptr as *const RawControl) }
    }

    pub fn is_initialized(&self) -> bool {
        self.raw().magic.load(Ordering::Acquire) == CONTROL_MAGIC
    }

    /// Resets the block to `published`. Called by the session initiator while
    /// holding the writer lock.
    pub fn initialize(&self, published: PublishedVersion) -> Result<()> {
        ensure!(
            !matches!(self.region, ControlRegion::SharedReadOnly(_)),
            ArenaError::ReadOnly
        );
        let raw = self.raw();
        raw.seq.store(0, Ordering::Relaxed);
        raw.writer_active.store(0, Ordering::Relaxed);
        raw.commits.store(0, Ordering::Relaxed);
        raw.version.store(published.version, Ordering::Relaxed);
        raw.top_ref.store(published.top_ref, Ordering::Relaxed);
        raw.file_size.store(published.file_size, Ordering::Relaxed);
        raw.magic.store(CONTROL_MAGIC, Ordering::Release);
        *self.last_consistent.lock() = Some(published);
        Ok(())
    }

    pub fn read(&self) -> PublishedVersion {
        let raw = self.raw();
        let mut spins = 0u32;
        loop {
            let s1 = raw.seq.load(Ordering::Acquire);
            let published = PublishedVersion {
                version: raw.version.load(Ordering::Acquire),
                top_ref: raw.top_ref.load(Ordering::Acquire),
                file_size: raw.file_size.load(Ordering::Acquire),
            };
            fence(Ordering::Acquire);
            let s2 = raw.seq.load(Ordering::Relaxed);
            if s1 == s2 && s1 % 2 == 0 {
                *self.last_consistent.lock() = Some(published);
                return published;
            }
            if spins >= SEQLOCK_SPIN_LIMIT {
                let fallback = *self.last_consistent.lock();
                tracing::warn!(
                    seq = s2,
                    has_fallback = fallback.is_some(),
                    "control block publication stayed inconsistent; using last consistent read"
                );
                return fallback.unwrap_or(published);
            }
            spins += 1;
            std::hint::spin_loop();
        }
    }

    /// Publishes a committed version. The caller holds the writer lock.
    pub fn publish(&self, published: PublishedVersion) {
        let raw = self.raw();
        if raw.seq.load(Ordering::Relaxed) % 2 == 1 {
            tracing::warn!("repairing seqlock left odd by an interrupted publish");
            raw.seq.fetch_add(1, Ordering::Relaxed);
        }
        raw.seq.fetch_add(1, Ordering::AcqRel);
        raw.version.store(published.version, Ordering::Release);
        raw.top_ref.store(published.top_ref, Ordering::Release);
        raw.file_size.store(published.file_size, Ordering::Release);
        raw.commits.fetch_add(1, Ordering::Relaxed);
        raw.seq.fetch_add(1, Ordering::Release);
        self.notify_change();
    }

    /// Current value of the change word, read before checking a wait
    /// condition and handed to `wait_change`.
    pub fn change_count(&self) -> u32 {
        self.raw().change.load(Ordering::Acquire)
    }

    /// Whether `wait_change` sleeps until the next `notify_change` in any
    /// process. When false, callers wait with a bounded timeout instead.
    pub fn can_block_on_change(&self) -> bool {
        cfg!(target_os = "linux") && !matches!(self.region, ControlRegion::SharedReadOnly(_))
    }

    /// Bumps the change word and wakes every sleeper on it. A no-op on a
    /// read-only mapping.
    pub fn notify_change(&self) {
        if matches!(self.region, ControlRegion::SharedReadOnly(_)) {
            return;
        }
        let raw = self.raw();
        raw.change.fetch_add(1, Ordering::Release);
        futex::wake_all(&raw.change);
    }

    /// Sleeps while the change word still equals `observed`. Returns early on
    /// signals and spurious wakeups; callers re-check their condition.
    pub fn wait_change(&self, observed: u32) -> Result<()> {
        futex::wait(&self.raw().change, observed)
    }

    /// Marks `pid` as the active writer and returns the previous marker. A
    /// nonzero previous marker means a writer died holding the lock.
    pub fn mark_writer(&self, pid: u64) -> u64 {
        self.raw().writer_active.swap(pid, Ordering::AcqRel)
    }

    pub fn clear_writer(&self) {
        self.raw().writer_active.store(0, Ordering::Release);
    }

    pub fn commits(&self) -> u64 {
        self.raw().commits.load(Ordering::Relaxed)
    }
}

#[cfg(target_os = "linux")]
mod futex {
    use std::sync::atomic::AtomicU32;

    use eyre::{bail, Result};

    pub fn wait(word: &AtomicU32, expected: u32) -> Result<()> {
        // SAFETY: `word` is a live, aligned u32 for the duration of the call.
        // Without FUTEX_PRIVATE_FLAG the kernel keys the wait on the backing
        // page, so sleepers in other processes mapping the lock file share it.
        let result = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                std::ptr::null::<libc::timespec>(),
            )
        };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(()),
            _ => bail!("futex wait on control block failed: {}", err),
        }
    }

    pub fn wake_all(word: &AtomicU32) {
        // SAFETY: as in `wait`; FUTEX_WAKE only reads the address.
        unsafe {
            libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, i32::MAX);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod futex {
    use std::sync::atomic::AtomicU32;

    use eyre::{bail, Result};

    pub fn wait(_word: &AtomicU32, _expected: u32) -> Result<()> {
        bail!("blocking on the control block is not supported on this platform")
    }

    pub fn wake_all(_word: &AtomicU32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn published(version: u64) -> PublishedVersion {
        PublishedVersion {
            version,
            top_ref: version * 16,
            file_size: 4096 * version,
        }
    }

    #[test]
    fn local_block_round_trips_publication() {
        let block = ControlBlock::local();
        assert!(!block.is_initialized());

        block.initialize(published(1)).unwrap();
        block.publish(published(2));

        assert!(block.is_initialized());
        assert_eq!(block.read(), published(2));
        assert_eq!(block.commits(), 1);
    }

    #[test]
    fn shared_block_is_visible_through_a_second_mapping() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("shared.db");

        let first = ControlBlock::open_shared(&db, false).unwrap();
        first.initialize(published(1)).unwrap();
        let second = ControlBlock::open_shared(&db, false).unwrap();

        first.publish(published(7));

        assert!(second.is_initialized());
        assert_eq!(second.read(), published(7));
        assert!(lock_file_path(&db).exists());
    }

    #[test]
    fn read_only_without_lock_file_is_local() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("none.db");

        let block = ControlBlock::open_shared(&db, true).unwrap();

        assert!(!block.is_shared());
        assert!(!lock_file_path(&db).exists());
    }

    #[test]
    fn writer_marker_reports_previous_holder() {
        let block = ControlBlock::local();

        assert_eq!(block.mark_writer(42), 0);
        assert_eq!(block.mark_writer(43), 42);
        block.clear_writer();
        assert_eq!(block.mark_writer(44), 0);
    }

    #[test]
    fn odd_sequence_is_repaired_on_publish() {
        let block = ControlBlock::local();
        block.initialize(published(1)).unwrap();
        block.raw().seq.store(3, Ordering::Relaxed);

        block.publish(published(2));

        assert_eq!(block.raw().seq.load(Ordering::Relaxed) % 2, 0);
        assert_eq!(block.read(), published(2));
    }

    #[test]
    fn stuck_sequence_falls_back_to_last_consistent_read() {
        let block = ControlBlock::local();
        block.initialize(published(1)).unwrap();
        block.publish(published(2));
        assert_eq!(block.read(), published(2));

        let raw = block.raw();
        raw.seq.fetch_add(1, Ordering::Relaxed);
        raw.version.store(3, Ordering::Relaxed);
        raw.top_ref.store(999, Ordering::Relaxed);

        assert_eq!(block.read(), published(2));
    }

    #[test]
    fn publish_bumps_the_change_word() {
        let block = ControlBlock::local();
        block.initialize(published(1)).unwrap();
        let before = block.change_count();

        block.publish(published(2));

        assert_eq!(block.change_count(), before.wrapping_add(1));
    }

    #[test]
    fn wait_change_returns_at_once_when_the_word_moved() {
        let block = ControlBlock::local();
        let observed = block.change_count();
        block.notify_change();

        if block.can_block_on_change() {
            block.wait_change(observed).unwrap();
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn waiter_on_one_mapping_is_woken_through_another() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let dir = tempdir().unwrap();
        let db = dir.path().join("wake.db");
        let waiting = Arc::new(ControlBlock::open_shared(&db, false).unwrap());
        waiting.initialize(published(1)).unwrap();
        let publishing = ControlBlock::open_shared(&db, false).unwrap();
        assert!(waiting.can_block_on_change());

        let observed = waiting.change_count();
        let waiter = {
            let waiting = Arc::clone(&waiting);
            thread::spawn(move || {
                while waiting.change_count() == observed {
                    waiting.wait_change(observed).unwrap();
                }
                waiting.read()
            })
        };
        thread::sleep(Duration::from_millis(20));
        publishing.publish(published(5));

        assert_eq!(waiter.join().unwrap(), published(5));
    }

    #[test]
    fn read_only_mapping_cannot_block_on_change() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("ro.db");
        ControlBlock::open_shared(&db, false)
            .unwrap()
            .initialize(published(1))
            .unwrap();

        let block = ControlBlock::open_shared(&db, true).unwrap();

        assert!(block.is_shared());
        assert!(!block.can_block_on_change());
        block.notify_change();
    }

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lock_file_path(Path::new("/tmp/data.db")),
            PathBuf::from("/tmp/data.db.lock")
        );
    }
}
