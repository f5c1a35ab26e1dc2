//! # Runtime Configuration
//!
//! `Config` carries the per-database options chosen at open time. Numeric
//! defaults come from `crate::config::constants`; `validate` rejects
//! combinations that cannot work before anything touches the disk.
//!
//! | Option                 | Default  | Effect                                   |
//! |------------------------|----------|------------------------------------------|
//! | `read_only`            | false    | no write transactions, no file changes   |
//! | `no_create`            | false    | fail instead of creating a missing file  |
//! | `session_initiator`    | true     | may (re)initialize shared state          |
//! | `encryption_key`       | none     | 32-byte key, needs a `PageCipher`        |
//! | `section_shift`        | 26       | log2 of the section size                 |
//! | `initial_ring_capacity`| 32       | read-lock ring entries before growth     |
//! | `slab_memory_limit`    | none     | cap on slab memory per write transaction |

use std::fmt;

use eyre::{ensure, Result};

use crate::config::{DEFAULT_SECTION_SHIFT, INITIAL_RING_CAPACITY, MAX_SECTION_SHIFT, MIN_SECTION_SHIFT};
use crate::storage::EncryptionKey;

#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub read_only: bool,
    pub no_create: bool,
    pub session_initiator: bool,
    pub encryption_key: Option<EncryptionKey>,
    pub section_shift: u32,
    pub initial_ring_capacity: usize,
    pub slab_memory_limit: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_only: false,
            no_create: false,
            session_initiator: true,
            encryption_key: None,
            section_shift: DEFAULT_SECTION_SHIFT,
            initial_ring_capacity: INITIAL_RING_CAPACITY,
            slab_memory_limit: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("read_only", &self.read_only)
            .field("no_create", &self.no_create)
            .field("session_initiator", &self.session_initiator)
            .field("encrypted", &self.encryption_key.is_some())
            .field("section_shift", &self.section_shift)
            .field("initial_ring_capacity", &self.initial_ring_capacity)
            .field("slab_memory_limit", &self.slab_memory_limit)
            .finish()
    }
}

impl Config {
    pub fn section_size(&self) -> u64 {
        1u64 << self.section_shift
    }

    pub fn validate(&self, has_cipher: bool) -> Result<()> {
        ensure!(
            (MIN_SECTION_SHIFT..=MAX_SECTION_SHIFT).contains(&self.section_shift),
            "section shift {} outside supported range {}..={}",
            self.section_shift,
            MIN_SECTION_SHIFT,
            MAX_SECTION_SHIFT
        );
        ensure!(
            self.initial_ring_capacity >= 2,
            "initial ring capacity must be at least 2, got {}",
            self.initial_ring_capacity
        );
        ensure!(
            self.encryption_key.is_none() || has_cipher,
            "an encryption key was given without a page cipher"
        );
        ensure!(
            self.encryption_key.is_some() || !has_cipher,
            "a page cipher was given without an encryption key"
        );
        Ok(())
    }
}
