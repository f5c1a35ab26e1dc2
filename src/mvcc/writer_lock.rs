//! # Writer Exclusion
//!
//! At most one write transaction exists per database, across threads and
//! across processes. Two layers enforce that:
//!
//! 1. An in-process flag guarded by a `parking_lot::Mutex`, with a `Condvar`
//!    that blocking acquirers wait on
//! 2. `flock(LOCK_EX)` on the `<db>.lock` file, taken only after the
//!    in-process flag is held
//!
//! The kernel drops a `flock` when its holder dies, so a crashed writer never
//! wedges the database. Whether the previous holder died is detected one
//! level up, through the writer marker in the control block.
//!
//! Platforms without `flock` fall back to in-process exclusion only.

use std::fs::File;
use std::io;

use eyre::Result;
use parking_lot::{Condvar, Mutex};

use crate::error::ArenaError;

#[derive(Debug)]
pub struct WriterLock {
    held: Mutex<bool>,
    released: Condvar,
    lock_file: Option<File>,
}

impl WriterLock {
    pub fn new(lock_file: Option<File>) -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
            lock_file,
        }
    }

    /// Acquires the lock. With `nonblocking`, returns `Ok(false)` instead of
    /// waiting when another writer holds it.
    pub fn acquire(&self, nonblocking: bool) -> Result<bool> {
        {
            let mut held = self.held.lock();
            while *held {
                if nonblocking {
                    return Ok(false);
                }
                self.released.wait(&mut held);
            }
            *held = true;
        }

        let Some(file) = &self.lock_file else {
            return Ok(true);
        };

        match lock_exclusive(file, nonblocking) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.release_local();
                Ok(false)
            }
            Err(e) => {
                self.release_local();
                Err(eyre::Report::new(ArenaError::access(format!(
                    "failed to lock database for writing: {}",
                    e
                ))))
            }
        }
    }

    pub fn release(&self) {
        if let Some(file) = &self.lock_file {
            if let Err(e) = unlock(file) {
                tracing::warn!(error = %e, "failed to release interprocess writer lock");
            }
        }
        self.release_local();
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }

    fn release_local(&self) {
        *self.held.lock() = false;
        self.released.notify_one();
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File, nonblocking: bool) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let op = if nonblocking {
        libc::LOCK_EX | libc::LOCK_NB
    } else {
        libc::LOCK_EX
    };
    loop {
        // SAFETY: flock only reads the descriptor, which `file` keeps open.
        let result = unsafe { libc::flock(file.as_raw_fd(), op) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EWOULDBLOCK) if nonblocking => return Ok(false),
            _ => return Err(err),
        }
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: flock only reads the descriptor, which `file` keeps open.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File, _nonblocking: bool) -> io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn nonblocking_acquire_fails_while_held() {
        let lock = WriterLock::new(None);

        assert!(lock.acquire(true).unwrap());
        assert!(!lock.acquire(true).unwrap());

        lock.release();
        assert!(lock.acquire(true).unwrap());
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let lock = Arc::new(WriterLock::new(None));
        assert!(lock.acquire(false).unwrap());

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.acquire(false).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        lock.release();
        assert!(waiter.join().unwrap());
        assert!(lock.is_held());
    }

    #[cfg(unix)]
    #[test]
    fn file_lock_excludes_a_second_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");
        let open = || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .unwrap()
        };
        let first = WriterLock::new(Some(open()));
        let second = WriterLock::new(Some(open()));

        assert!(first.acquire(true).unwrap());
        assert!(!second.acquire(true).unwrap());
        assert!(!second.is_held());

        first.release();
        assert!(second.acquire(true).unwrap());
    }
}
