//! # Database Builder
//!
//! `DatabaseBuilder` configures and opens a database. Settings are chained
//! before calling `open()`.
//!
//! ## Storage Selection
//!
//! - **File**: `path()` opens or creates a database file. Refs are file
//!   offsets and committed sections are memory-mapped read-only. A sibling
//!   `<file>.lock` carries the shared control block and the writer lock, so
//!   several processes (or several `Database` values in one process) can
//!   attach the same file.
//!
//! - **Buffer**: `buffer()` attaches a caller-supplied byte vector. An empty
//!   vector becomes a fresh database. Nothing is shared beyond the
//!   `Database` clones.
//!
//! ## Configuration Options
//!
//! | Option                | Default | Description                              |
//! |-----------------------|---------|------------------------------------------|
//! | read_only             | false   | Reject write transactions                |
//! | no_create             | false   | Fail if the file does not exist          |
//! | session_initiator     | true    | May initialize the shared control block  |
//! | encryption_key        | none    | 32-byte key handed to the page cipher    |
//! | section_shift         | 26      | log2 of the section size (64MB)          |
//! | initial_ring_capacity | 32      | Read-lock entries before the ring grows  |
//! | slab_memory_limit     | none    | Cap on slab bytes per write transaction  |
//!
//! ## Usage Examples
//!
//! ```ignore
//! let db = Database::builder()
//!     .path("./data.arena")
//!     .section_shift(20)
//!     .open()?;
//! ```
//!
//! ### Encrypted file:
//!
//! ```ignore
//! let db = Database::builder()
//!     .path("./secret.arena")
//!     .encryption_key(key)
//!     .cipher(Arc::new(MyCipher))
//!     .open()?;
//! ```

use std::path::Path;
use std::sync::Arc;

use eyre::Result;

use super::config::Config;
use super::database::Database;
use crate::replication::{NoReplication, Replication};
use crate::storage::{EncryptionKey, PageCipher, StorageKind};

/// Use `Database::builder()` to create one.
pub struct DatabaseBuilder {
    storage_kind: Option<StorageKind>,
    config: Config,
    cipher: Option<Arc<dyn PageCipher>>,
    replication: Option<Arc<dyn Replication>>,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self {
            storage_kind: None,
            config: Config::default(),
            cipher: None,
            replication: None,
        }
    }

    /// Opens or creates the database file at `path`.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.storage_kind = Some(StorageKind::file(path));
        self
    }

    /// Attaches an in-memory buffer. An empty buffer becomes a new database.
    pub fn buffer(mut self, bytes: Vec<u8>) -> Self {
        self.storage_kind = Some(StorageKind::buffer(bytes));
        self
    }

    pub fn storage_kind(mut self, kind: StorageKind) -> Self {
        self.storage_kind = Some(kind);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn no_create(mut self, no_create: bool) -> Self {
        self.config.no_create = no_create;
        self
    }

    /// Whether this attachment may initialize shared state. A non-initiator
    /// attaching before any initiator gets a `Retry` error.
    pub fn session_initiator(mut self, initiator: bool) -> Self {
        self.config.session_initiator = initiator;
        self
    }

    /// Requires a cipher, see [`DatabaseBuilder::cipher`].
    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.config.encryption_key = Some(key);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn PageCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn section_shift(mut self, shift: u32) -> Self {
        self.config.section_shift = shift;
        self
    }

    pub fn initial_ring_capacity(mut self, capacity: usize) -> Self {
        self.config.initial_ring_capacity = capacity;
        self
    }

    pub fn slab_memory_limit(mut self, bytes: usize) -> Self {
        self.config.slab_memory_limit = Some(bytes);
        self
    }

    pub fn replication(mut self, replication: Arc<dyn Replication>) -> Self {
        self.replication = Some(replication);
        self
    }

    /// Replaces every option at once. The storage kind, cipher and
    /// replication hooks are kept.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Opens or creates the database with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No storage kind was specified (call `path()` or `buffer()` first)
    /// - The configuration is invalid (see [`Config::validate`])
    /// - The file is missing, inaccessible or not a database
    /// - A non-initiator attaches before the shared state exists (`Retry`)
    pub fn open(self) -> Result<Database> {
        let storage_kind = self.storage_kind.ok_or_else(|| {
            eyre::eyre!("storage kind not specified: call .path() or .buffer() first")
        })?;
        let replication = self
            .replication
            .unwrap_or_else(|| Arc::new(NoReplication));

        Database::open_with(storage_kind, self.config, self.cipher, replication)
    }

    pub fn get_storage_kind(&self) -> Option<&StorageKind> {
        self.storage_kind.as_ref()
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn builder_path_sets_storage_kind() {
        let builder = DatabaseBuilder::new().path("/tmp/test.arena");

        let kind = builder.get_storage_kind().unwrap();
        assert!(kind.is_file());
        assert_eq!(kind.path(), Some(&PathBuf::from("/tmp/test.arena")));
    }

    #[test]
    fn builder_options_land_in_config() {
        let builder = DatabaseBuilder::new()
            .buffer(Vec::new())
            .read_only(true)
            .no_create(true)
            .session_initiator(false)
            .section_shift(20)
            .initial_ring_capacity(4)
            .slab_memory_limit(1 << 20);

        let config = builder.get_config();
        assert!(config.read_only);
        assert!(config.no_create);
        assert!(!config.session_initiator);
        assert_eq!(config.section_shift, 20);
        assert_eq!(config.initial_ring_capacity, 4);
        assert_eq!(config.slab_memory_limit, Some(1 << 20));
    }

    #[test]
    fn builder_open_without_storage_kind_fails() {
        let result = DatabaseBuilder::new().open();

        match result {
            Err(e) => assert!(e.to_string().contains("storage kind not specified")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn builder_key_without_cipher_fails() {
        let result = DatabaseBuilder::new()
            .buffer(Vec::new())
            .encryption_key([7; 32])
            .open();

        assert!(result.is_err());
    }

    #[test]
    fn builder_open_creates_then_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.arena");

        let db = DatabaseBuilder::new().path(&path).open().unwrap();
        drop(db);
        assert!(path.exists());

        let db = DatabaseBuilder::new()
            .path(&path)
            .no_create(true)
            .open()
            .unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
    }
}
