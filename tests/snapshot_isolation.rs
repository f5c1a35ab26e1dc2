//! # Snapshot Isolation Test Suite
//!
//! Readers pin a committed version and keep seeing exactly its bytes while a
//! writer commits newer versions on top.
//!
//! ## Test Categories
//!
//! 1. **Pinned readers**: old versions stay readable across commits
//! 2. **Version selection**: begin_read by number, pruned versions
//! 3. **Mapping lifetime**: retained mappings are purged after readers end
//! 4. **Ring growth**: more pinned versions than the initial ring holds
//! 5. **Concurrency**: reader threads racing a committing writer
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test snapshot_isolation
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use arenadb::{ArenaError, Database, ErrorKind, Ref, TxnStage};
use tempfile::tempdir;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn small_sections(path: &std::path::Path) -> Database {
    Database::builder()
        .path(path)
        .section_shift(16)
        .open()
        .expect("failed to open database")
}

/// Commits one allocation holding `value`, made the new top-ref.
fn commit_value(db: &Database, value: u64) -> (u64, Ref) {
    let mut txn = db.begin_write(false).unwrap().unwrap();
    let r = txn.allocate(8).unwrap();
    txn.translate_mut(r).unwrap().copy_from_slice(&value.to_le_bytes());
    txn.set_top_ref(r).unwrap();
    (txn.commit().unwrap(), r)
}

fn read_top(txn: &arenadb::Transaction) -> u64 {
    let bytes = txn.translate(txn.top_ref()).unwrap();
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

// ============================================================================
// PINNED READERS
// ============================================================================

#[test]
fn reader_keeps_its_version_across_later_commits() {
    let dir = tempdir().unwrap();
    let db = small_sections(&dir.path().join("snap.arena"));

    for value in 2..=5 {
        commit_value(&db, value * 100);
    }
    let reader = db.begin_read(None).unwrap();
    assert_eq!(reader.version(), Some(5));

    commit_value(&db, 600);
    commit_value(&db, 700);

    assert_eq!(read_top(&reader), 500);
    assert_eq!(db.latest_version(), 7);
    let latest = db.begin_read(None).unwrap();
    assert_eq!(read_top(&latest), 700);
}

#[test]
fn retained_mappings_are_purged_once_the_reader_ends() {
    let dir = tempdir().unwrap();
    let db = small_sections(&dir.path().join("purge.arena"));

    for value in 2..=5 {
        commit_value(&db, value);
    }
    let mut reader = db.begin_read(None).unwrap();
    commit_value(&db, 6);
    commit_value(&db, 7);

    let held = db.metrics().mappings;
    assert!(held.retained_tables > 0);
    assert_eq!(read_top(&reader), 5);

    reader.end_read().unwrap();
    db.purge_old_mappings();

    let purged = db.metrics().mappings;
    assert_eq!(purged.retained_tables, 0);
    assert_eq!(purged.retained_mappings, 0);
    assert_eq!(db.metrics().ring.oldest_version, 7);
}

#[test]
fn frozen_snapshot_outlives_the_reader_it_came_from() {
    let dir = tempdir().unwrap();
    let db = small_sections(&dir.path().join("frozen.arena"));
    commit_value(&db, 42);

    let reader = db.begin_read(None).unwrap();
    let frozen = reader.freeze().unwrap();
    drop(reader);
    commit_value(&db, 43);
    db.purge_old_mappings();

    assert_eq!(frozen.stage(), TxnStage::Frozen);
    assert_eq!(read_top(&frozen), 42);
}

// ============================================================================
// VERSION SELECTION
// ============================================================================

#[test]
fn begin_read_of_a_pinned_version_succeeds() {
    let db = Database::in_memory().unwrap();
    commit_value(&db, 10);
    let pin = db.begin_read(Some(2)).unwrap();
    commit_value(&db, 20);

    let again = db.begin_read(Some(2)).unwrap();

    assert_eq!(read_top(&again), 10);
    drop(pin);
}

#[test]
fn begin_read_of_a_pruned_version_is_bad_version() {
    let db = Database::in_memory().unwrap();
    commit_value(&db, 10);
    commit_value(&db, 20);

    let err = db.begin_read(Some(2)).unwrap_err();

    assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::BadVersion));
}

#[test]
fn begin_read_of_a_future_version_is_bad_version() {
    let db = Database::in_memory().unwrap();

    let err = db.begin_read(Some(99)).unwrap_err();

    assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::BadVersion));
}

// ============================================================================
// RING GROWTH
// ============================================================================

#[test]
fn ring_grows_past_initial_capacity_without_losing_readers() {
    let db = Database::builder()
        .buffer(Vec::new())
        .section_shift(16)
        .initial_ring_capacity(4)
        .open()
        .unwrap();

    let mut readers = Vec::new();
    for value in 0..40u64 {
        commit_value(&db, value);
        readers.push(db.begin_read(None).unwrap());
    }

    let ring = db.metrics().ring;
    assert!(ring.capacity >= 40);
    assert_eq!(ring.readers, 40);
    for (value, reader) in readers.iter().enumerate() {
        assert_eq!(read_top(reader), value as u64);
    }

    readers.clear();
    assert_eq!(db.metrics().ring.live, 1);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn readers_never_see_a_torn_version() {
    let dir = tempdir().unwrap();
    let db = small_sections(&dir.path().join("race.arena"));
    commit_value(&db, 0);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last = 0;
                while !done.load(Ordering::Acquire) {
                    let txn = db.begin_read(None).unwrap();
                    let value = read_top(&txn);
                    assert_eq!(value + 2, txn.version().unwrap());
                    assert!(value >= last);
                    last = value;
                }
            })
        })
        .collect();

    for value in 1..200 {
        commit_value(&db, value);
    }
    done.store(true, Ordering::Release);

    for handle in readers {
        handle.join().unwrap();
    }
}
