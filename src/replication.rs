//! # Replication Hook
//!
//! A history or replication component observes transaction boundaries
//! through [`Replication`]. The version manager calls it:
//!
//! | Event                          | Call                                |
//! |--------------------------------|-------------------------------------|
//! | read or write transaction opens| `on_initiate(version, is_write)`    |
//! | commit, after the data is flushed | `on_prepare_commit(version)`     |
//! | commit is durable and published| `on_finalize_commit()`              |
//! | write transaction rolled back  | `on_abort()`                        |
//!
//! `on_prepare_commit` chooses the new version number and may veto the commit
//! by returning an error, in which case the write transaction is rolled back.
//! The returned version must be greater than the one the transaction started
//! from.

use eyre::Result;

pub trait Replication: Send + Sync {
    fn on_initiate(&self, _version: u64, _is_write: bool) {}

    fn on_prepare_commit(&self, version: u64) -> Result<u64> {
        Ok(version + 1)
    }

    fn on_finalize_commit(&self) {}

    fn on_abort(&self) {}
}

/// Default hook: versions count up by one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplication;

impl Replication for NoReplication {}
