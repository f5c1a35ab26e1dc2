//! # Multi-Instance Test Suite
//!
//! Several `Database` values attached to one file behave like separate
//! processes: they share the control block and the writer lock through
//! `<file>.lock` and nothing else.
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test multi_instance
//! ```

use std::thread;
use std::time::Duration;

use arenadb::{ArenaError, Database, ErrorKind, Ref};
use tempfile::tempdir;

fn commit_bytes(db: &Database, value: &[u8]) -> (u64, Ref) {
    let mut txn = db.begin_write(false).unwrap().unwrap();
    let r = txn.allocate(value.len()).unwrap();
    txn.translate_mut(r).unwrap()[..value.len()].copy_from_slice(value);
    txn.set_top_ref(r).unwrap();
    (txn.commit().unwrap(), r)
}

#[test]
fn commits_are_visible_to_other_instances() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.arena");
    let first = Database::open(&path).unwrap();
    let second = Database::builder()
        .path(&path)
        .session_initiator(false)
        .open()
        .unwrap();

    let (version, r) = commit_bytes(&first, b"from the first");

    assert_eq!(second.latest_version(), version);
    let reader = second.begin_read(None).unwrap();
    assert_eq!(reader.top_ref(), r);
    assert_eq!(&reader.translate(r).unwrap()[..14], b"from the first");
}

#[test]
fn only_one_instance_writes_at_a_time() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("exclusive.arena");
    let first = Database::open(&path).unwrap();
    let second = Database::open(&path).unwrap();

    let writer = first.begin_write(false).unwrap().unwrap();
    assert!(second.begin_write(true).unwrap().is_none());

    drop(writer);
    assert!(second.begin_write(true).unwrap().is_some());
}

#[test]
fn writers_alternate_between_instances() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("alternate.arena");
    let first = Database::open(&path).unwrap();
    let second = Database::open(&path).unwrap();

    commit_bytes(&first, b"one");
    commit_bytes(&second, b"two");
    let (version, r) = commit_bytes(&first, b"three");

    for db in [&first, &second] {
        let reader = db.begin_read(None).unwrap();
        assert_eq!(reader.version(), Some(version));
        assert_eq!(&reader.translate(r).unwrap()[..5], b"three");
    }
}

#[test]
fn blocked_writer_proceeds_after_release() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("blocked.arena");
    let first = Database::open(&path).unwrap();
    let second = Database::open(&path).unwrap();

    let writer = first.begin_write(false).unwrap().unwrap();
    let waiter = thread::spawn(move || {
        let mut txn = second.begin_write(false).unwrap().unwrap();
        let r = txn.allocate(8).unwrap();
        txn.set_top_ref(r).unwrap();
        txn.commit().unwrap()
    });

    thread::sleep(Duration::from_millis(50));
    drop(writer);

    let version = waiter.join().unwrap();
    assert_eq!(first.latest_version(), version);
}

#[test]
fn non_initiator_before_any_initiator_must_retry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("retry.arena");
    drop(Database::open(&path).unwrap());
    std::fs::remove_file(arenadb::mvcc::lock_file_path(&path)).unwrap();

    let err = Database::builder()
        .path(&path)
        .session_initiator(false)
        .open()
        .unwrap_err();

    assert_eq!(ArenaError::kind_of(&err), Some(ErrorKind::Retry));
    assert!(Database::open(&path).is_ok());
}

#[test]
fn reopen_continues_from_the_last_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.arena");
    let (version, r) = {
        let db = Database::open(&path).unwrap();
        commit_bytes(&db, b"durable")
    };

    let db = Database::open(&path).unwrap();

    assert_eq!(db.latest_version(), version);
    let reader = db.begin_read(None).unwrap();
    assert_eq!(reader.top_ref(), r);
    assert_eq!(&reader.translate(r).unwrap()[..7], b"durable");
}

#[test]
fn header_wins_over_a_stale_control_block() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stale.arena");
    let lock_path = arenadb::mvcc::lock_file_path(&path);

    drop(Database::open(&path).unwrap());
    let stale = std::fs::read(&lock_path).unwrap();
    let (_, r) = {
        let db = Database::open(&path).unwrap();
        commit_bytes(&db, b"after")
    };
    // A writer that died after switching the header but before publishing
    // leaves exactly this: a new header and an old control block.
    std::fs::write(&lock_path, stale).unwrap();

    let db = Database::open(&path).unwrap();

    let reader = db.begin_read(None).unwrap();
    assert_eq!(reader.top_ref(), r);
    assert_eq!(&reader.translate(r).unwrap()[..5], b"after");
}

#[test]
fn read_only_instance_follows_a_writer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("follow.arena");
    let writer = Database::open(&path).unwrap();
    let reader_db = Database::builder().path(&path).read_only(true).open().unwrap();

    let (version, r) = commit_bytes(&writer, b"seen");

    let reader = reader_db.begin_read(None).unwrap();
    assert_eq!(reader.version(), Some(version));
    assert_eq!(&reader.translate(r).unwrap()[..4], b"seen");
}
